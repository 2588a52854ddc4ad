//! Directory listing discovery
//!
//! The GSOD server publishes no index beyond the HTML directory pages, so the
//! lister scrapes anchors out of whatever markup the server renders (Apache
//! fancy-index tables, `<pre>` listings, nginx autoindex). Parsing is
//! permissive about the markup and strict about file names: only anchors whose
//! final path segment is a `STATION-WBAN-YEAR.op.gz` archive of the listed year
//! survive.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info};
use url::Url;

use super::{year_url, ArchiveTransport};
use crate::app::models::{ArchiveName, RemoteEntry, RemoteListing, YearEntry};
use crate::constants::gsod;
use crate::errors::{ListingError, ListingResult};

const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M", "%d-%b-%Y %H:%M"];

fn anchor_selector() -> &'static Selector {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    SELECTOR.get_or_init(|| Selector::parse("a[href]").expect("anchor selector is valid"))
}

fn size_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+(?:\.\d+)?)([KMGkmg])?$").expect("size pattern is valid")
    })
}

fn year_link_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(gsod::YEAR_LINK_PATTERN).expect("year pattern is valid"))
}

/// Lists year directories and their archives
#[derive(Clone)]
pub struct DirectoryLister {
    transport: Arc<dyn ArchiveTransport>,
    base_url: Url,
}

impl DirectoryLister {
    pub fn new(transport: Arc<dyn ArchiveTransport>, base_url: Url) -> Self {
        Self {
            transport,
            base_url,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Fetch and parse the listing of one year directory
    ///
    /// Performs a single request; no caching, no retry.
    ///
    /// # Errors
    ///
    /// Returns `ListingError::ListingUnavailable` if the request fails or the
    /// body is not a directory listing at all
    pub async fn list(&self, year: i32) -> ListingResult<RemoteListing> {
        let url = year_url(&self.base_url, year)?;
        debug!("Listing year {} at {}", year, url);

        let html = self
            .transport
            .fetch_page(&url)
            .await
            .map_err(|e| ListingError::year(year, e.to_string()))?;

        let listing = parse_year_listing(year, &html)?;
        info!("Year {}: {} archives listed", year, listing.len());
        Ok(listing)
    }

    /// Fetch the root index and return the year directories, ascending
    ///
    /// With `changed_since`, only years whose directory timestamp is at or
    /// after that instant are returned; years without a timestamp are kept.
    pub async fn list_years(
        &self,
        changed_since: Option<DateTime<Utc>>,
    ) -> ListingResult<Vec<YearEntry>> {
        let html = self
            .transport
            .fetch_page(&self.base_url)
            .await
            .map_err(|e| ListingError::ListingUnavailable {
                target: "year index".to_string(),
                reason: e.to_string(),
            })?;

        let years = parse_year_index(&html)?;
        let selected: Vec<YearEntry> = match changed_since {
            Some(since) => years
                .into_iter()
                .filter(|entry| entry.last_modified.map_or(true, |at| at >= since))
                .collect(),
            None => years,
        };
        debug!("Year index: {} directories selected", selected.len());
        Ok(selected)
    }
}

/// Parse a year directory page into its archive entries
pub fn parse_year_listing(year: i32, html: &str) -> ListingResult<RemoteListing> {
    let document = parse_listing_document(html).map_err(|reason| ListingError::year(year, reason))?;

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for anchor in document.select(anchor_selector()) {
        let Some(file_name) = anchor.value().attr("href").and_then(final_segment) else {
            continue;
        };
        let Some(archive) = ArchiveName::parse(file_name) else {
            continue;
        };
        if archive.year != year {
            debug!(
                "Discarding {} from year {} listing: archive year {}",
                file_name, year, archive.year
            );
            continue;
        }
        if !seen.insert(file_name.to_string()) {
            continue;
        }

        let (size_bytes, last_modified) = parse_metadata(&metadata_text(anchor));
        entries.push(RemoteEntry {
            file_name: file_name.to_string(),
            size_bytes,
            last_modified,
        });
    }

    Ok(RemoteListing::new(year, entries))
}

/// Parse the root page into year directories, ascending, one per year
pub fn parse_year_index(html: &str) -> ListingResult<Vec<YearEntry>> {
    let document =
        parse_listing_document(html).map_err(|reason| ListingError::ListingUnavailable {
            target: "year index".to_string(),
            reason,
        })?;

    let mut years: BTreeMap<i32, Option<DateTime<Utc>>> = BTreeMap::new();
    for anchor in document.select(anchor_selector()) {
        let Some(segment) = anchor.value().attr("href").and_then(final_segment) else {
            continue;
        };
        let Some(year) = year_link_regex()
            .captures(segment)
            .and_then(|c| c[1].parse::<i32>().ok())
        else {
            continue;
        };
        if year < gsod::FIRST_YEAR {
            continue;
        }
        let (_, last_modified) = parse_metadata(&metadata_text(anchor));
        years.entry(year).or_insert(last_modified);
    }

    Ok(years
        .into_iter()
        .map(|(year, last_modified)| YearEntry {
            year,
            last_modified,
        })
        .collect())
}

fn parse_listing_document(html: &str) -> Result<Html, String> {
    if html.trim().is_empty() {
        return Err("empty listing body".to_string());
    }
    let document = Html::parse_document(html);
    if document.select(anchor_selector()).next().is_none() {
        return Err("no anchors in listing body".to_string());
    }
    Ok(document)
}

/// Final path segment of an href, ignoring query, fragment and trailing `/`
fn final_segment(href: &str) -> Option<&str> {
    let path = href.split(['?', '#']).next().unwrap_or(href);
    let path = path.trim_end_matches('/');
    let segment = path.rsplit('/').next().unwrap_or(path);
    (!segment.is_empty()).then_some(segment)
}

/// Text that carries an anchor's listing metadata
///
/// Table listings keep size and date in the anchor's row; `<pre>` listings put
/// them after the anchor on the same line.
fn metadata_text(anchor: ElementRef<'_>) -> String {
    let row = anchor
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|element| element.value().name() == "tr");
    if let Some(row) = row {
        return row.text().collect::<Vec<_>>().join(" ");
    }

    let mut line = String::new();
    for sibling in anchor.next_siblings() {
        match sibling.value() {
            Node::Text(text) => {
                if let Some((head, _)) = text.split_once('\n') {
                    line.push_str(head);
                    break;
                }
                line.push_str(text);
            }
            Node::Element(element) if element.name() == "a" => break,
            Node::Element(_) => {
                if let Some(element) = ElementRef::wrap(sibling) {
                    line.extend(element.text());
                }
            }
            _ => {}
        }
    }
    line
}

/// Extract `(size, last-modified)` from a listing line
///
/// The first `date time` token pair in a supported format is the timestamp;
/// the first size token after it (or anywhere, without a timestamp) is the size.
pub(crate) fn parse_metadata(text: &str) -> (Option<u64>, Option<DateTime<Utc>>) {
    let tokens: Vec<&str> = text.split_whitespace().collect();

    let mut last_modified = None;
    let mut size_from = 0;
    for (index, pair) in tokens.windows(2).enumerate() {
        if let Some(at) = parse_timestamp(&format!("{} {}", pair[0], pair[1])) {
            last_modified = Some(at);
            size_from = index + 2;
            break;
        }
    }

    let size_bytes = tokens
        .iter()
        .skip(size_from)
        .find_map(|token| parse_size(token));

    (size_bytes, last_modified)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    TIMESTAMP_FORMATS.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(value, format)
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    })
}

/// Parse `4096`, `4.0K`, `1.2M` or `3G` (1024-based); `-` is no size
pub(crate) fn parse_size(token: &str) -> Option<u64> {
    let captures = size_regex().captures(token)?;
    let value: f64 = captures[1].parse().ok()?;
    let multiplier = match captures.get(2).map(|m| m.as_str().to_ascii_uppercase()) {
        None => 1u64,
        Some(unit) if unit == "K" => 1 << 10,
        Some(unit) if unit == "M" => 1 << 20,
        Some(_) => 1 << 30,
    };
    Some((value * multiplier as f64).round() as u64)
}
