//! Maps a query name to its handler chain.
//!
//! Patterns are domain templates: `*` matches any run of characters, and an
//! optional `/TYPE1|TYPE2` suffix restricts a route to those question types.
//!
//! - `example.com` matches only `example.com`
//! - `*.example.com` matches every subdomain of `example.com`
//! - `*.example.com/A|AAAA` matches address queries for those subdomains

use regex::{Regex, RegexBuilder};
use std::sync::Arc;

use crate::error::DnsError;
use crate::plugin::{Chain, Handler};
use crate::types::RecordType;

/// A route pattern compiled once at registration.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    matcher: Regex,
    types: Option<Vec<RecordType>>,
}

impl Pattern {
    pub fn compile(pattern: &str) -> Result<Self, DnsError> {
        let invalid = || DnsError::InvalidPattern(pattern.to_string());
        let (domain, types) = match pattern.split_once('/') {
            Some((domain, types)) => (domain, Some(types)),
            None => (pattern, None),
        };
        let domain = domain.trim().trim_end_matches('.');
        if domain.is_empty() {
            return Err(invalid());
        }

        let body = domain.split('*').map(regex::escape).collect::<Vec<_>>().join(".*");
        let matcher = RegexBuilder::new(&format!("^{}$", body))
            .case_insensitive(true)
            .build()
            .map_err(|_| invalid())?;

        let types = match types {
            Some(list) => {
                let parsed = list.split('|').map(|t| t.parse::<RecordType>()).collect::<Result<Vec<_>, _>>().map_err(|_| invalid())?;
                if parsed.is_empty() { return Err(invalid()); }
                Some(parsed)
            }
            None => None,
        };

        Ok(Self { source: pattern.to_string(), matcher, types })
    }

    pub fn source(&self) -> &str { &self.source }

    pub fn matches(&self, name: &str, qtype: RecordType) -> bool {
        let name = name.strip_suffix('.').unwrap_or(name);
        if !self.matcher.is_match(name) {
            return false;
        }
        match &self.types {
            Some(types) => types.iter().any(|t| *t == qtype || *t == RecordType::ANY),
            None => true,
        }
    }

    fn same_route(&self, other: &Pattern) -> bool {
        self.matcher.as_str() == other.matcher.as_str() && self.types == other.types
    }
}

struct Route {
    pattern: Pattern,
    handlers: Vec<Arc<dyn Handler>>,
}

#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    middleware: Vec<Arc<dyn Handler>>,
}

impl Router {
    pub fn new() -> Self { Self::default() }

    /// Registers a handler for a pattern. Identical patterns share one chain, appended in order.
    pub fn handle(&mut self, pattern: &str, handler: Arc<dyn Handler>) -> Result<(), DnsError> {
        let compiled = Pattern::compile(pattern)?;
        if let Some(route) = self.routes.iter_mut().find(|r| r.pattern.same_route(&compiled)) {
            route.handlers.push(handler);
            return Ok(());
        }
        tracing::debug!("Registered route '{}' ({})", pattern, compiled.matcher.as_str());
        self.routes.push(Route { pattern: compiled, handlers: vec![handler] });
        Ok(())
    }

    /// Appends a global middleware, run ahead of every route for every query.
    pub fn use_middleware(&mut self, handler: Arc<dyn Handler>) {
        self.middleware.push(handler);
    }

    /// Middleware followed by the handlers of every matching route, in registration order.
    pub fn chain_for(&self, name: &str, qtype: RecordType) -> Chain {
        let mut handlers = self.middleware.clone();
        for route in &self.routes {
            if route.pattern.matches(name, qtype) {
                handlers.extend(route.handlers.iter().cloned());
            }
        }
        Chain::new(handlers)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.pattern.source())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Request, Response};
    use crate::plugin::Next;

    struct Named(&'static str);

    #[async_trait::async_trait]
    impl Handler for Named {
        fn name(&self) -> &str { self.0 }
        async fn handle(&self, req: &Request, res: &mut Response, next: Next<'_>) -> anyhow::Result<()> {
            next.run(req, res).await
        }
    }

    fn named(n: &'static str) -> Arc<dyn Handler> { Arc::new(Named(n)) }

    #[test]
    fn wildcard_and_literal_patterns() {
        let p = Pattern::compile("*.example.com").unwrap();
        assert!(p.matches("www.example.com", RecordType::A));
        assert!(p.matches("a.b.example.com", RecordType::MX));
        assert!(p.matches("WWW.Example.COM.", RecordType::A));
        assert!(!p.matches("example.com", RecordType::A));
        assert!(!p.matches("wwwXexample.com", RecordType::A));

        let exact = Pattern::compile("example.com").unwrap();
        assert!(exact.matches("example.com", RecordType::A));
        assert!(!exact.matches("sub.example.com", RecordType::A));
    }

    #[test]
    fn record_type_filter() {
        let p = Pattern::compile("example.com/A|MX").unwrap();
        assert!(p.matches("example.com", RecordType::A));
        assert!(p.matches("example.com", RecordType::MX));
        assert!(!p.matches("example.com", RecordType::TXT));
        assert!(Pattern::compile("example.com/NOPE").is_err());
        assert!(Pattern::compile("/A").is_err());
    }

    #[test]
    fn chain_is_middleware_then_matching_routes_in_registration_order() {
        let mut router = Router::new();
        router.handle("*.example.com", named("wild")).unwrap();
        router.use_middleware(named("log"));
        router.handle("www.example.com", named("www")).unwrap();
        router.handle("*.example.com", named("wild2")).unwrap();
        router.handle("other.org", named("other")).unwrap();

        let chain = router.chain_for("www.example.com", RecordType::A);
        assert_eq!(chain.names(), vec!["log", "wild", "wild2", "www"]);

        let miss = router.chain_for("nothing.net", RecordType::A);
        assert_eq!(miss.names(), vec!["log"]);
        assert_eq!(router.patterns().count(), 3);
    }
}
