//! Who is calling: the inputs that pick a caller's identifier and tier.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};

use crate::ratelimit::{Identifier, Tier};

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";

/// Identity attached to a request by the host's authentication layer.
///
/// Requests without this extension are treated as anonymous and identified
/// by address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthenticatedCaller {
    pub user_id: String,
    pub premium: bool,
}

impl AuthenticatedCaller {
    pub fn new(user_id: impl Into<String>, premium: bool) -> Self {
        Self {
            user_id: user_id.into(),
            premium,
        }
    }
}

/// Everything the gatekeeper looks at to classify a caller.
#[derive(Debug, Clone, Copy)]
pub struct CallerContext<'a> {
    /// Authenticated user id, if any
    pub user_id: Option<&'a str>,
    /// Request headers, consulted for proxy-forwarded addresses
    pub headers: &'a HeaderMap,
    /// Address of the directly connected peer
    pub peer_addr: Option<IpAddr>,
    /// Whether the caller has a premium subscription
    pub premium: bool,
}

impl<'a> CallerContext<'a> {
    /// Context of an anonymous caller.
    pub fn anonymous(headers: &'a HeaderMap, peer_addr: Option<IpAddr>) -> Self {
        Self {
            user_id: None,
            headers,
            peer_addr,
            premium: false,
        }
    }

    /// Build the context from an axum request, reading the
    /// [`AuthenticatedCaller`] and `ConnectInfo<SocketAddr>` extensions.
    pub fn from_request<B>(request: &'a Request<B>) -> Self {
        let extensions = request.extensions();
        let peer_addr = extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        match extensions.get::<AuthenticatedCaller>() {
            Some(caller) => Self {
                user_id: Some(caller.user_id.as_str()),
                headers: request.headers(),
                peer_addr,
                premium: caller.premium,
            },
            None => Self::anonymous(request.headers(), peer_addr),
        }
    }

    /// Pick the identifier quota is counted against.
    ///
    /// Priority: user id, first `X-Forwarded-For` entry, `X-Real-IP`, peer
    /// address, then the shared `ip:unknown` bucket.
    pub fn identifier(&self) -> Identifier {
        if let Some(uid) = self.user_id.filter(|uid| !uid.is_empty()) {
            return Identifier::user(uid);
        }

        self.forwarded_for()
            .or_else(|| self.header_value(REAL_IP))
            .map(Identifier::ip)
            .or_else(|| self.peer_addr.map(|addr| Identifier::ip(addr.to_string())))
            .unwrap_or_else(Identifier::unknown)
    }

    /// Tier selected by the premium flag.
    pub fn tier(&self) -> Tier {
        Tier::from_premium(self.premium)
    }

    fn forwarded_for(&self) -> Option<&'a str> {
        self.header_value(FORWARDED_FOR)?
            .split(',')
            .next()
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
    }

    fn header_value(&self, name: &str) -> Option<&'a str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn peer() -> Option<IpAddr> {
        Some("10.1.2.3".parse().unwrap())
    }

    #[test]
    fn test_user_id_wins() {
        let headers = headers(&[("x-forwarded-for", "203.0.113.7")]);
        let caller = CallerContext {
            user_id: Some("alice"),
            headers: &headers,
            peer_addr: peer(),
            premium: true,
        };

        assert_eq!(caller.identifier(), Identifier::user("alice"));
        assert_eq!(caller.tier(), Tier::Premium);
    }

    #[test]
    fn test_empty_user_id_is_anonymous() {
        let headers = HeaderMap::new();
        let caller = CallerContext {
            user_id: Some(""),
            headers: &headers,
            peer_addr: peer(),
            premium: false,
        };

        assert_eq!(caller.identifier(), Identifier::ip("10.1.2.3"));
    }

    #[test]
    fn test_forwarded_for_uses_first_entry() {
        let headers = headers(&[
            ("x-forwarded-for", " 203.0.113.7 , 198.51.100.1"),
            ("x-real-ip", "192.0.2.9"),
        ]);
        let caller = CallerContext::anonymous(&headers, peer());

        assert_eq!(caller.identifier(), Identifier::ip("203.0.113.7"));
        assert_eq!(caller.tier(), Tier::Standard);
    }

    #[test]
    fn test_real_ip_before_peer() {
        let headers = headers(&[("x-real-ip", "192.0.2.9")]);
        let caller = CallerContext::anonymous(&headers, peer());

        assert_eq!(caller.identifier(), Identifier::ip("192.0.2.9"));
    }

    #[test]
    fn test_blank_forwarded_for_falls_through() {
        let headers = headers(&[("x-forwarded-for", " , 198.51.100.1")]);
        let caller = CallerContext::anonymous(&headers, peer());

        assert_eq!(caller.identifier(), Identifier::ip("10.1.2.3"));
    }

    #[test]
    fn test_nothing_known_is_unknown() {
        let headers = HeaderMap::new();
        let caller = CallerContext::anonymous(&headers, None);

        assert_eq!(caller.identifier(), Identifier::unknown());
        assert_eq!(caller.identifier().to_string(), "ip:unknown");
    }

    #[test]
    fn test_from_request_reads_extensions() {
        let mut request = Request::builder()
            .uri("/upload")
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 1, 2, 3], 40000))));

        let caller = CallerContext::from_request(&request);
        assert_eq!(caller.peer_addr, peer());
        assert_eq!(caller.identifier(), Identifier::ip("203.0.113.7"));

        request
            .extensions_mut()
            .insert(AuthenticatedCaller::new("bob", true));

        let caller = CallerContext::from_request(&request);
        assert_eq!(caller.identifier(), Identifier::user("bob"));
        assert_eq!(caller.tier(), Tier::Premium);
    }
}
