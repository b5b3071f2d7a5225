//! Identity resolution: reduce any place reference (URL, short link, or
//! free-text query) to a canonical reference and a stable identity key.
//!
//! Resolution is pure and never fails: malformed input falls back to the
//! content-hash path. Resolving an already-canonical reference returns it
//! unchanged.

use std::sync::OnceLock;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use regex::Regex;
use sha2::{Digest, Sha256};
use url::Url;

use crate::types::{CanonicalReference, InputKind};

/// Query parameters that survive cleaning. Everything else is treated as
/// tracking noise and stripped before hashing or storage.
const ALLOWED_QUERY_KEYS: &[&str] = &["cid", "ftid", "q", "query", "query_place_id", "hl", "gl"];

/// Known tracking parameters, dropped even before the allow-list check.
const DROPPED_QUERY_KEYS: &[&str] = &["g_st", "fbclid", "gclid", "mc_id", "mc_eid"];

/// Percent-encoding set for path segments. Includes `%` and `+` so that
/// decode-then-re-encode is stable: a literal `+` must not read back as the
/// space it means in Google's `/maps/place/Name+With+Plus` convention.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'+')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'%')
    .add(b'/');

fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)https?://[^\s<>"'）)]+"#).expect("valid URL regex"))
}

/// Extract the first http/https URL from arbitrary text, trimming trailing
/// punctuation that commonly clings to pasted links.
pub fn extract_first_url(text: &str) -> Option<String> {
    let m = url_pattern().find(text)?;
    let url = m
        .as_str()
        .trim_end_matches(|c| matches!(c, ')' | '.' | ',' | ';' | '。' | '，' | '；' | '）'));
    if url.is_empty() {
        None
    } else {
        Some(url.to_string())
    }
}

fn is_maps_domain(host: &str) -> bool {
    host.contains("google.com") || host.contains("google.co") || host.starts_with("maps.google.")
}

fn is_short_link_host(host: &str) -> bool {
    host.starts_with("maps.app.goo.gl") || host.starts_with("goo.gl")
}

/// First 16 hex chars of SHA-256: a fixed-length, stable content hash. Also
/// used as the review-id fallback for sources that provide none.
pub fn content_hash16(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Strip tracking/analytics parameters, keeping only the allow-list.
/// Returns the input unchanged when it does not parse as a URL.
pub fn clean_tracking_params(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, v)| {
            let k = k.to_lowercase();
            !v.is_empty()
                && !k.starts_with("utm_")
                && !DROPPED_QUERY_KEYS.contains(&k.as_str())
                && ALLOWED_QUERY_KEYS.contains(&k.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let mut pairs = parsed.query_pairs_mut();
        pairs.clear();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
        drop(pairs);
    }
    parsed.to_string()
}

#[derive(Debug, Default)]
struct MapComponents {
    place_id: Option<String>,
    ftid: Option<String>,
    cid: Option<String>,
    display_name: Option<String>,
    search_query: Option<String>,
}

fn decode_segment(segment: &str) -> String {
    // Raw `+` means space in map path segments; an encoded `%2B` is a literal
    // plus and must survive, so the swap happens before percent-decoding.
    percent_decode_str(&segment.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

fn parse_map_components(parsed: &Url) -> MapComponents {
    let mut out = MapComponents::default();

    for (k, v) in parsed.query_pairs() {
        match k.to_lowercase().as_str() {
            "cid" if !v.is_empty() => out.cid = Some(v.into_owned()),
            "ftid" if !v.is_empty() => out.ftid = Some(v.into_owned()),
            "query_place_id" if !v.is_empty() => out.place_id = Some(v.into_owned()),
            "q" => {
                if let Some(pid) = v.strip_prefix("place_id:") {
                    if !pid.is_empty() {
                        out.place_id = Some(pid.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    match segments.as_slice() {
        ["maps", "place", name, ..] | ["place", name, ..] => {
            let name = decode_segment(name);
            if !name.is_empty() {
                out.display_name = Some(name);
            }
        }
        ["maps", "search", query, ..] => {
            let query = decode_segment(query);
            if !query.is_empty() {
                out.search_query = Some(query);
            }
        }
        _ => {}
    }

    out
}

fn search_reference(query: &str) -> CanonicalReference {
    let encoded = utf8_percent_encode(query, SEGMENT).to_string();
    let reference_url = format!("https://www.google.com/maps/search/{encoded}");
    let identity_key = format!("search:{}", content_hash16(&reference_url));
    CanonicalReference {
        reference_url,
        identity_key,
        display_name: query.to_string(),
        place_id: None,
        cid: None,
        input_kind: InputKind::Search,
    }
}

fn hash_fallback(reference: &str) -> CanonicalReference {
    CanonicalReference {
        reference_url: reference.to_string(),
        identity_key: format!("url:{}", content_hash16(reference)),
        display_name: String::new(),
        place_id: None,
        cid: None,
        input_kind: InputKind::Url,
    }
}

/// Normalize a place URL into a canonical reference.
///
/// Identity key precedence: place identifier (`place:` / `ftid:`) over
/// listing id (`cid:`) over content hash of the cleaned URL (`url:`).
/// Identifier-derived keys are stable across cosmetic URL changes; the hash
/// path is the last resort.
pub fn canonicalize(url: &str) -> CanonicalReference {
    let cleaned = clean_tracking_params(url);
    let Ok(mut parsed) = Url::parse(&cleaned) else {
        return hash_fallback(url.trim());
    };

    let host = parsed.host_str().unwrap_or("").to_lowercase();
    let components = parse_map_components(&parsed);

    // A bare search URL is a query in URL clothing: keep it in the search
    // namespace so it can never collide with place-derived keys.
    if components.place_id.is_none() && components.ftid.is_none() && components.cid.is_none() {
        if let Some(query) = &components.search_query {
            return search_reference(query);
        }
    }

    let base_host = if is_maps_domain(&host) {
        "www.google.com".to_string()
    } else {
        host.clone()
    };

    let display_name = components.display_name.clone().unwrap_or_default();

    if let Some(pid) = components.place_id {
        return CanonicalReference {
            reference_url: format!("https://{base_host}/maps/place/?q=place_id:{pid}"),
            identity_key: format!("place:{pid}"),
            display_name,
            place_id: Some(pid),
            cid: components.cid,
            input_kind: InputKind::Url,
        };
    }

    if let Some(ftid) = components.ftid {
        let reference_url = if display_name.is_empty() {
            format!("https://{base_host}/maps/place/?ftid={ftid}")
        } else {
            let name = utf8_percent_encode(&display_name, SEGMENT);
            format!("https://{base_host}/maps/place/{name}/?ftid={ftid}")
        };
        return CanonicalReference {
            reference_url,
            identity_key: format!("ftid:{ftid}"),
            display_name,
            place_id: None,
            cid: components.cid,
            input_kind: InputKind::Url,
        };
    }

    if let Some(cid) = components.cid {
        return CanonicalReference {
            reference_url: format!("https://{base_host}/maps?cid={cid}"),
            identity_key: format!("cid:{cid}"),
            display_name,
            place_id: None,
            cid: Some(cid),
            input_kind: InputKind::Url,
        };
    }

    // No identifier extractable: scheme-normalized, cleaned URL hash.
    let _ = parsed.set_scheme("https");
    if is_maps_domain(&host) {
        let _ = parsed.set_host(Some("www.google.com"));
        if !parsed.path().starts_with("/maps") {
            parsed.set_path("/maps");
        }
    }
    let reference_url = parsed.to_string();
    CanonicalReference {
        identity_key: format!("url:{}", content_hash16(&reference_url)),
        reference_url,
        display_name,
        place_id: None,
        cid: None,
        input_kind: InputKind::Url,
    }
}

/// Resolve arbitrary input — URL, short link, or free text — into a
/// canonical reference. Pure and idempotent: resolving a reference's own
/// `reference_url` returns the same reference.
pub fn resolve(input: &str) -> CanonicalReference {
    let text = input.trim();

    if let Some(url) = extract_first_url(text) {
        let host = Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
            .unwrap_or_default();
        let mut reference = canonicalize(&url);
        if is_short_link_host(&host) && reference.input_kind == InputKind::Url {
            reference.input_kind = InputKind::ShortUrl;
        }
        return reference;
    }

    search_reference(text)
}
