//! File names for URL downloads.
//!
//! A URL job stores its file as `url<idx>_<name>`, where `<name>` comes from
//! the server's `Content-Disposition` header when present and from the last
//! path segment otherwise.

use std::path::{Component, Path};

use url::Url;

/// Name used when neither the header nor the URL path yields one.
pub const FALLBACK_FILENAME: &str = "download";

/// Extracts the file name announced by a `Content-Disposition` header.
///
/// The RFC 5987 `filename*=charset''value` form wins over `filename=`, which
/// may be quoted or bare.
#[must_use]
pub fn parse_content_disposition(header: &str) -> Option<String> {
    let params: Vec<&str> = header.split(';').map(str::trim).collect();

    let extended = params.iter().find_map(|param| {
        let value = strip_param(param, "filename*")?;
        let (_, encoded) = value.split_once("''")?;
        urlencoding::decode(encoded.trim_matches('"'))
            .ok()
            .map(std::borrow::Cow::into_owned)
    });
    if let Some(name) = extended.filter(|name| !name.is_empty()) {
        return Some(name);
    }

    params.iter().find_map(|param| {
        let value = strip_param(param, "filename")?;
        let value = value
            .strip_prefix('"')
            .and_then(|rest| rest.split('"').next())
            .unwrap_or(value)
            .trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Returns the value of `param` if it is `name=value`, ignoring key case.
fn strip_param<'a>(param: &'a str, name: &str) -> Option<&'a str> {
    let (key, value) = param.split_once('=')?;
    key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
}

/// Replaces characters that are unsafe in a single path segment.
///
/// Separators, Windows-reserved characters and control characters become
/// `_`; a name made only of dots is neutralised so it cannot escape the
/// target directory.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if cleaned.is_empty() {
        return "_".to_string();
    }
    if is_plain_segment(&cleaned) {
        cleaned
    } else {
        cleaned.replace('.', "_")
    }
}

fn is_plain_segment(name: &str) -> bool {
    Path::new(name)
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
}

/// Derives a file name from the last non-empty path segment of `url`.
#[must_use]
pub fn filename_from_url(url: &Url) -> Option<String> {
    let segment = url
        .path_segments()?
        .rev()
        .find(|segment| !segment.is_empty())?;
    let decoded = urlencoding::decode(segment).map_or_else(|_| segment.to_string(), |s| s.into_owned());
    Some(sanitize_filename(&decoded))
}

/// Picks the download name: header first, then URL path, then [`FALLBACK_FILENAME`].
#[must_use]
pub fn choose_filename(content_disposition: Option<&str>, url: &Url) -> String {
    content_disposition
        .and_then(parse_content_disposition)
        .map(|name| sanitize_filename(&name))
        .or_else(|| filename_from_url(url))
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string())
}
