//! Ingress routing helpers: mapping a public request onto a tenant id.

/// Extract the tenant id from a Host header value in subdomain mode.
///
/// The port (if any) is stripped, then the host must end with
/// `.<base_domain>`; everything before that suffix is the tenant id, so
/// `x.y.base` yields `x.y`. The bare base domain yields `None`.
pub fn extract_subdomain<'a>(host: &'a str, base_domain: &str) -> Option<&'a str> {
    let host = match host.rfind(':') {
        Some(idx) => &host[..idx],
        None => host,
    };

    if host.len() <= base_domain.len() + 1 {
        return None;
    }

    let (prefix, suffix) = host.split_at(host.len() - base_domain.len() - 1);
    if suffix.len() > 1 && suffix.as_bytes()[0] == b'.' && &suffix[1..] == base_domain {
        Some(prefix)
    } else {
        None
    }
}

/// First path segment of a request path, used as a tenant candidate.
pub fn tenant_from_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix('/')?;
    let segment = rest
        .split(|c| c == '/' || c == '?')
        .next()
        .unwrap_or_default();
    if segment.is_empty() {
        None
    } else {
        Some(segment)
    }
}

/// Strip exactly `/{tenant}` (and an optional trailing slash) from a path.
///
/// A partial prefix match (`/abcdef` against tenant `abc`) is left alone;
/// stripping down to nothing yields `/`.
pub fn strip_tenant_prefix(path: &str, tenant_id: &str) -> String {
    let Some(rest) = path.strip_prefix('/').and_then(|p| p.strip_prefix(tenant_id)) else {
        return path.to_string();
    };

    match rest.as_bytes().first() {
        // Exactly "/{tenant}".
        None => "/".to_string(),
        Some(b'/') => {
            if rest.len() == 1 {
                "/".to_string()
            } else {
                rest.to_string()
            }
        }
        // "/{tenant}xyz" — not a segment boundary.
        Some(_) => path.to_string(),
    }
}

/// Query-preserving variant of [`strip_tenant_prefix`] for request targets.
pub fn strip_tenant_target(target: &str, tenant_id: &str) -> String {
    match target.split_once('?') {
        Some((path, query)) => format!("{}?{}", strip_tenant_prefix(path, tenant_id), query),
        None => strip_tenant_prefix(target, tenant_id),
    }
}

/// Pull a tenant candidate out of a Referer URL's path.
pub fn tenant_from_referer(referer: &str) -> Option<&str> {
    let after_scheme = match referer.find("://") {
        Some(idx) => &referer[idx + 3..],
        None => referer,
    };
    let path_start = after_scheme.find('/')?;
    tenant_from_path(&after_scheme[path_start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "tunnel.example.com";

    #[test]
    fn subdomain_extraction() {
        assert_eq!(extract_subdomain("myapp.tunnel.example.com", BASE), Some("myapp"));
        assert_eq!(
            extract_subdomain("myapp.tunnel.example.com:8443", BASE),
            Some("myapp")
        );
        assert_eq!(extract_subdomain("x.y.tunnel.example.com", BASE), Some("x.y"));
        assert_eq!(extract_subdomain("tunnel.example.com", BASE), None);
        assert_eq!(extract_subdomain("other.zzz", BASE), None);
        assert_eq!(extract_subdomain("nottunnel.example.com", BASE), None);
        assert_eq!(extract_subdomain("", BASE), None);
    }

    #[test]
    fn path_segment_extraction() {
        assert_eq!(tenant_from_path("/myapp/foo"), Some("myapp"));
        assert_eq!(tenant_from_path("/myapp"), Some("myapp"));
        assert_eq!(tenant_from_path("/myapp?x=1"), Some("myapp"));
        assert_eq!(tenant_from_path("/"), None);
        assert_eq!(tenant_from_path(""), None);
    }

    #[test]
    fn prefix_strip_rules() {
        assert_eq!(strip_tenant_prefix("/myapp/foo", "myapp"), "/foo");
        assert_eq!(strip_tenant_prefix("/myapp/", "myapp"), "/");
        assert_eq!(strip_tenant_prefix("/myapp", "myapp"), "/");
        // Partial prefix must not strip.
        assert_eq!(strip_tenant_prefix("/abcdef", "abc"), "/abcdef");
        // Unrelated paths are untouched.
        assert_eq!(strip_tenant_prefix("/assets/style.css", "myapp"), "/assets/style.css");
        assert_eq!(strip_tenant_prefix("/", "myapp"), "/");
    }

    #[test]
    fn prefix_strip_is_idempotent_on_stripped_paths() {
        let stripped = strip_tenant_prefix("/myapp/foo", "myapp");
        assert_eq!(strip_tenant_prefix(&stripped, "myapp"), stripped);
    }

    #[test]
    fn target_strip_keeps_query() {
        assert_eq!(strip_tenant_target("/myapp/foo?x=1&y=2", "myapp"), "/foo?x=1&y=2");
        assert_eq!(strip_tenant_target("/myapp?x=1", "myapp"), "/?x=1");
        assert_eq!(strip_tenant_target("/other?x=1", "myapp"), "/other?x=1");
    }

    #[test]
    fn referer_resolution() {
        assert_eq!(
            tenant_from_referer("https://tunnel.example.com/myapp/page"),
            Some("myapp")
        );
        assert_eq!(tenant_from_referer("https://tunnel.example.com/"), None);
        assert_eq!(tenant_from_referer("https://tunnel.example.com"), None);
        assert_eq!(tenant_from_referer("not a url"), None);
    }
}
