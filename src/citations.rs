use crate::streaming::CitationItem;
use crate::types::Citation;

const TRACKING_PREFIXES: &[&str] = &["utm_"];
const TRACKING_EXACT: &[&str] = &["ref", "fbclid", "gclid", "mc_cid", "mc_eid", "igshid"];

fn is_tracking_param(key: &str) -> bool {
    TRACKING_EXACT.contains(&key) || TRACKING_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Normalize a URL for dedup: lowercase scheme+host, strip a leading `www.`,
/// drop tracking query params, sort remaining params, drop the fragment, and
/// trim a trailing slash from the path. Idempotent by construction.
pub fn normalize_url(url: &str) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(url) else {
        return url.trim_end_matches('/').to_string();
    };

    let scheme = parsed.scheme().to_lowercase();
    let _ = parsed.set_scheme(&scheme);

    if let Some(host) = parsed.host_str() {
        let host = host.to_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
        let _ = parsed.set_host(Some(&host));
    }

    parsed.set_fragment(None);

    let mut params: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    params.sort();

    if params.is_empty() {
        parsed.set_query(None);
    } else {
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        parsed.set_query(Some(&query));
    }

    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        parsed.set_path(path.trim_end_matches('/'));
    }

    let mut out = parsed.to_string();
    if out.ends_with('/') && parsed.path() == "/" && parsed.query().is_none() {
        out.pop();
    }
    out
}

/// Extract `[title](url)` markdown links and bare `http(s)://` URLs from free
/// text. Bare URLs fall back to the host as their title.
pub fn extract_citations(text: &str) -> Vec<Citation> {
    let mut out = Vec::new();

    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'[' {
            if let Some(close) = text[i..].find("](") {
                let title_end = i + close;
                let url_start = title_end + 2;
                if let Some(url_end_rel) = text[url_start..].find(')') {
                    let url_end = url_start + url_end_rel;
                    let title = text[i + 1..title_end].to_string();
                    let url = text[url_start..url_end].to_string();
                    if url.starts_with("http://") || url.starts_with("https://") {
                        out.push(Citation { title, url });
                        i = url_end + 1;
                        continue;
                    }
                }
            }
        }
        i += 1;
    }

    for scheme in ["https://", "http://"] {
        let mut search_from = 0;
        while let Some(rel) = text[search_from..].find(scheme) {
            let start = search_from + rel;
            // Skip if this URL is already part of a markdown link we captured.
            let preceded_by_paren = start > 0 && text.as_bytes()[start - 1] == b'(';
            let end = text[start..]
                .find(|c: char| c.is_whitespace() || c == ')' || c == ']')
                .map(|e| start + e)
                .unwrap_or(text.len());
            let url = &text[start..end];
            if !preceded_by_paren && !out.iter().any(|c: &Citation| c.url == url) {
                let title = reqwest::Url::parse(url)
                    .ok()
                    .and_then(|u| u.host_str().map(|h| h.to_string()))
                    .unwrap_or_else(|| url.to_string());
                out.push(Citation { title, url: url.to_string() });
            }
            search_from = end;
        }
    }

    out
}

/// Merge citations from previews, tool/search results, annotations, and the
/// full answer text, normalizing and deduplicating by URL while preserving
/// the title of the first occurrence.
pub fn merge_citations(
    text_sources: &[&str],
    item_sources: &[&[CitationItem]],
) -> Vec<Citation> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for text in text_sources {
        for c in extract_citations(text) {
            let key = normalize_url(&c.url);
            if seen.insert(key.clone()) {
                out.push(Citation { title: c.title, url: key });
            }
        }
    }

    for items in item_sources {
        for item in items.iter() {
            let key = normalize_url(&item.url);
            if seen.insert(key.clone()) {
                out.push(Citation { title: item.title.clone(), url: key });
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_www_tracking_and_fragment() {
        let input = "HTTPS://WWW.Example.com/Path/?utm_source=x&b=2&a=1#frag";
        assert_eq!(normalize_url(input), "https://example.com/Path?a=1&b=2");
    }

    #[test]
    fn normalize_is_idempotent() {
        let input = "https://www.example.com/x?utm_source=y&z=1";
        let once = normalize_url(input);
        let twice = normalize_url(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn dedup_preserves_first_title() {
        let cited = merge_citations(
            &[],
            &[&[
                CitationItem { title: "A".into(), url: "https://www.example.com/x?utm_source=y".into() },
                CitationItem { title: "A dup".into(), url: "https://example.com/x".into() },
            ]],
        );
        assert_eq!(cited.len(), 1);
        assert_eq!(cited[0].title, "A");
    }

    #[test]
    fn extracts_markdown_links() {
        let text = "see [docs](https://example.com/docs) for more";
        let cites = extract_citations(text);
        assert_eq!(cites.len(), 1);
        assert_eq!(cites[0].title, "docs");
    }

    #[test]
    fn extracts_bare_urls_with_host_title() {
        let text = "check https://example.com/page for details";
        let cites = extract_citations(text);
        assert_eq!(cites.len(), 1);
        assert_eq!(cites[0].title, "example.com");
    }
}
