//! # Route Patterns
//!
//! A pattern is an optional method clause followed by a path template:
//!
//! ```text
//! /api                     prefix match: /api, /api/, /api/x/y (not /apix)
//! /google/*                one capture, everything after /google/
//! GET,POST /users/*/posts  method-restricted, one capture for the user segment(s)
//! GET|HEAD /static/*       `|` works as a method separator too
//! ```
//!
//! Each `*` matches one or more characters and yields a positional capture. A trailing
//! `*` takes the rest of the path; an inner `*` takes as little as possible. A pattern
//! that ends in a literal also matches any subpath of that literal.

use axum::http::Method;
use regex::Regex;

use crate::core::error::{GatewayError, GatewayResult};

/// Parsed route pattern
#[derive(Debug, Clone)]
pub struct RoutePattern {
    source: String,
    methods: Vec<Method>,
    path: String,
    prefix: String,
    regex: Regex,
}

impl RoutePattern {
    /// Parse `"[METHODS ]/path"`
    pub fn parse(pattern: &str) -> GatewayResult<Self> {
        let pattern = pattern.trim();
        let (clause, path) = match pattern.split_once(char::is_whitespace) {
            Some((clause, path)) => (Some(clause), path.trim()),
            None => (None, pattern),
        };

        let methods = match clause {
            Some(clause) => parse_methods(clause.split([',', '|']))?,
            None => Vec::new(),
        };

        Self::build(pattern, methods, path)
    }

    /// Parse and add extra allowed methods (duplicates are ignored)
    pub fn parse_with_methods<S: AsRef<str>>(pattern: &str, extra: &[S]) -> GatewayResult<Self> {
        let mut parsed = Self::parse(pattern)?;
        for method in parse_methods(extra.iter().map(|m| m.as_ref()))? {
            if !parsed.methods.contains(&method) {
                parsed.methods.push(method);
            }
        }
        Ok(parsed)
    }

    fn build(source: &str, methods: Vec<Method>, path: &str) -> GatewayResult<Self> {
        if path.is_empty() {
            return Err(GatewayError::config(format!("Route pattern '{}' has no path", source)));
        }

        let mut path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        while path.len() > 1 && path.ends_with('/') {
            path.pop();
        }

        let segments: Vec<&str> = path.split('*').collect();
        let wildcards = segments.len() - 1;

        let mut expression = String::from("^");
        for (index, literal) in segments.iter().enumerate() {
            expression.push_str(&regex::escape(literal));
            if index < wildcards {
                expression.push_str(if index + 1 == wildcards && segments[index + 1].is_empty() {
                    "(.+)"
                } else {
                    "(.+?)"
                });
            }
        }

        let ends_with_literal = segments.last().map(|s| !s.is_empty()).unwrap_or(false);
        if ends_with_literal {
            if path == "/" {
                expression.push_str(".*");
            } else {
                expression.push_str("(?:/.*)?");
            }
        }
        expression.push('$');

        let regex = Regex::new(&expression)
            .map_err(|e| GatewayError::config(format!("Invalid route pattern '{}': {}", source, e)))?;

        let prefix = if wildcards > 0 {
            segments[0].to_string()
        } else {
            path.clone()
        };

        Ok(Self {
            source: source.to_string(),
            methods,
            path,
            prefix,
            regex,
        })
    }

    /// The pattern as written
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Normalized path template
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Allowed methods; empty means any
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// Literal text before the first wildcard, or the whole path when there is none
    pub fn fixed_prefix(&self) -> &str {
        &self.prefix
    }

    /// Match a request, returning the wildcard captures in order
    pub fn matches(&self, method: &Method, path: &str) -> Option<Vec<String>> {
        if !self.methods.is_empty()
            && !self
                .methods
                .iter()
                .any(|allowed| allowed.as_str().eq_ignore_ascii_case(method.as_str()))
        {
            return None;
        }

        let captures = self.regex.captures(path)?;
        Some(
            captures
                .iter()
                .skip(1)
                .map(|capture| capture.map(|c| c.as_str().to_string()).unwrap_or_default())
                .collect(),
        )
    }

    /// Compute the forwarded URL for a matched request.
    ///
    /// With a trailing `/` on `target` the fixed prefix is stripped from the request path
    /// before appending; otherwise the full request path is appended. The query string
    /// is carried over unchanged.
    pub fn target_url(&self, target: &str, path: &str, query: Option<&str>) -> String {
        let mut url = if target.ends_with('/') {
            let remainder = path.strip_prefix(self.prefix.as_str()).unwrap_or(path);
            format!("{}{}", target, remainder.trim_start_matches('/'))
        } else if path.starts_with('/') {
            format!("{}{}", target, path)
        } else {
            format!("{}/{}", target, path)
        };

        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

fn parse_methods<'a>(methods: impl Iterator<Item = &'a str>) -> GatewayResult<Vec<Method>> {
    let mut parsed = Vec::new();
    for method in methods.map(str::trim).filter(|m| !m.is_empty()) {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| GatewayError::config(format!("Invalid HTTP method in route: {}", method)))?;
        if !parsed.contains(&method) {
            parsed.push(method);
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn captures(pattern: &str, path: &str) -> Option<Vec<String>> {
        RoutePattern::parse(pattern).unwrap().matches(&Method::GET, path)
    }

    #[test]
    fn test_prefix_match_at_segment_boundary() {
        for path in ["/api", "/api/", "/api/x/y"] {
            assert_eq!(captures("/api", path), Some(vec![]), "{path}");
        }
        assert_eq!(captures("/api", "/apix"), None);
        assert_eq!(captures("/api/", "/api/v1"), Some(vec![]));
        assert_eq!(captures("/", "/anything/at/all"), Some(vec![]));
    }

    #[test]
    fn test_wildcard_captures() {
        assert_eq!(captures("/google/*", "/google/search"), Some(vec!["search".to_string()]));
        assert_eq!(captures("/google/*", "/google/a/b/c"), Some(vec!["a/b/c".to_string()]));
        assert_eq!(captures("/google/*", "/google/"), None);
        assert_eq!(captures("/google/*", "/google"), None);

        assert_eq!(
            captures("/users/*/posts/*", "/users/42/posts/7/comments"),
            Some(vec!["42".to_string(), "7/comments".to_string()])
        );
        assert_eq!(
            captures("/users/*/profile", "/users/a/b/profile/photo"),
            Some(vec!["a/b".to_string()])
        );
        assert_eq!(captures("/users/*/profile", "/users/42"), None);
    }

    #[test]
    fn test_literal_characters_are_escaped() {
        assert_eq!(captures("/v1.0/items", "/v1.0/items"), Some(vec![]));
        assert_eq!(captures("/v1.0/items", "/v1x0/items"), None);
    }

    #[test]
    fn test_method_clause() {
        let pattern = RoutePattern::parse("get,POST /api/*").unwrap();
        assert_eq!(pattern.methods(), &[Method::GET, Method::POST]);
        assert_eq!(pattern.path(), "/api/*");
        assert!(pattern.matches(&Method::POST, "/api/x").is_some());
        assert!(pattern.matches(&Method::DELETE, "/api/x").is_none());

        let piped = RoutePattern::parse_with_methods("GET|HEAD /static/*", &["head", "PUT"]).unwrap();
        assert_eq!(piped.methods(), &[Method::GET, Method::HEAD, Method::PUT]);

        assert!(RoutePattern::parse("G@T /x").is_err());
        assert!(RoutePattern::parse("").is_err());
    }

    #[test]
    fn test_target_url_trailing_slash_strips_prefix() {
        let pattern = RoutePattern::parse("/google/*").unwrap();
        assert_eq!(
            pattern.target_url("https://www.google.com/", "/google/search", Some("q=x")),
            "https://www.google.com/search?q=x"
        );
        assert_eq!(
            pattern.target_url("https://www.google.com", "/google/search", Some("q=x")),
            "https://www.google.com/google/search?q=x"
        );
    }

    #[test]
    fn test_target_url_without_wildcard() {
        let pattern = RoutePattern::parse("/api").unwrap();
        assert_eq!(pattern.target_url("http://backend/v2/", "/api/users", None), "http://backend/v2/users");
        assert_eq!(pattern.target_url("http://backend/v2/", "/api", None), "http://backend/v2/");
        assert_eq!(pattern.target_url("http://backend", "/api/users", Some("")), "http://backend/api/users");
    }
}
