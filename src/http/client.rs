//! Client identification and route classification at the HTTP boundary.

use axum::http::HeaderMap;

use crate::throttle::Category;

/// Client id used when no forwarded address is present.
pub const LOOPBACK_CLIENT_ID: &str = "127.0.0.1";

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Derive the client id from `X-Forwarded-For`.
///
/// Takes the first entry of a comma-separated list, which is the original
/// client when the gateway sits behind a load balancer.
pub fn client_id(headers: &HeaderMap) -> String {
    headers
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(LOOPBACK_CLIENT_ID)
        .to_string()
}

/// Select the throttle category for a request path.
///
/// Returns `None` for paths that pass through unthrottled.
pub fn route_category(path: &str, protect_all_paths: bool) -> Option<Category> {
    if path == "/health" {
        return None;
    }
    if in_group(path, "/api/auth") {
        Some(Category::Auth)
    } else if in_group(path, "/api") {
        Some(Category::Api)
    } else if protect_all_paths {
        Some(Category::Default)
    } else {
        None
    }
}

fn in_group(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_client_id_single_address() {
        assert_eq!(client_id(&headers_with("203.0.113.7")), "203.0.113.7");
    }

    #[test]
    fn test_client_id_takes_first_of_list() {
        let headers = headers_with(" 203.0.113.7 , 10.0.0.1, 10.0.0.2");
        assert_eq!(client_id(&headers), "203.0.113.7");
    }

    #[test]
    fn test_client_id_defaults_to_loopback() {
        assert_eq!(client_id(&HeaderMap::new()), LOOPBACK_CLIENT_ID);
        assert_eq!(client_id(&headers_with("")), LOOPBACK_CLIENT_ID);
        assert_eq!(client_id(&headers_with(" , 10.0.0.1")), LOOPBACK_CLIENT_ID);
    }

    #[test]
    fn test_client_id_ignores_non_ascii_header() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_bytes(b"\xff\xfe").unwrap());
        assert_eq!(client_id(&headers), LOOPBACK_CLIENT_ID);
    }

    #[test]
    fn test_route_category() {
        assert_eq!(route_category("/api/auth/login", false), Some(Category::Auth));
        assert_eq!(route_category("/api/auth", false), Some(Category::Auth));
        assert_eq!(route_category("/api/properties", false), Some(Category::Api));
        assert_eq!(route_category("/api", false), Some(Category::Api));
        assert_eq!(route_category("/api/authors", false), Some(Category::Api));
        assert_eq!(route_category("/apiary", false), None);
        assert_eq!(route_category("/properties/42", false), None);
        assert_eq!(route_category("/health", false), None);
    }

    #[test]
    fn test_route_category_protect_all_paths() {
        assert_eq!(route_category("/properties/42", true), Some(Category::Default));
        assert_eq!(route_category("/api/bookings", true), Some(Category::Api));
        assert_eq!(route_category("/health", true), None);
    }
}
