//! Content-Type fix-up for the handful of static-asset extensions that
//! origins are prone to mis-serve as `text/plain` behind this proxy.

/// Canonical MIME type for `ext` if it's in the fix-up table, `None`
/// otherwise. `ext` should not include the leading dot.
pub fn canonical_mime_for_ext(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "js" => Some("application/javascript; charset=utf-8"),
        "css" => Some("text/css; charset=utf-8"),
        "html" | "htm" => Some("text/html; charset=utf-8"),
        "json" => Some("application/json; charset=utf-8"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "svg" => Some("image/svg+xml"),
        "woff" => Some("font/woff"),
        "woff2" => Some("font/woff2"),
        "ttf" => Some("font/ttf"),
        "eot" => Some("application/vnd.ms-fontobject"),
        _ => None,
    }
}

/// True when `content_type` is empty or bare `text/plain` (ignoring an
/// optional `; charset=...` suffix), the trigger condition for the fix-up.
pub fn is_fixup_candidate(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(ct) => {
            let ct = ct.trim();
            ct.is_empty() || ct.eq_ignore_ascii_case("text/plain") || {
                let base = ct.split(';').next().unwrap_or("").trim();
                base.eq_ignore_ascii_case("text/plain")
            }
        }
    }
}

/// Extract the file extension from a URL path, ignoring query/fragment.
pub fn extension_from_path(path: &str) -> Option<&str> {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let filename = path.rsplit('/').next().unwrap_or(path);
    filename.rsplit_once('.').map(|(_, ext)| ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn js_served_as_text_plain_is_fixed_up() {
        assert!(is_fixup_candidate(Some("text/plain")));
        assert_eq!(
            canonical_mime_for_ext(extension_from_path("/assets/app.js").unwrap()),
            Some("application/javascript; charset=utf-8")
        );
    }

    #[test]
    fn non_candidate_content_types_are_left_alone() {
        assert!(!is_fixup_candidate(Some("application/json")));
        assert!(!is_fixup_candidate(Some("image/png")));
    }

    #[test]
    fn extension_ignores_query_string() {
        assert_eq!(extension_from_path("/a/b/app.css?v=2"), Some("css"));
        assert_eq!(extension_from_path("/a/b/noext"), None);
    }
}
