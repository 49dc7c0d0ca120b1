//! Path-segment route tree
//!
//! Routes are organized as a trie over `/`-separated path segments
//! with three match modes:
//!
//! 1. Exact: the request path matches a registered path segment by
//!    segment.
//! 2. Default candidate: a `""` child (a path registered with a
//!    trailing `/`) becomes the fallback for everything below it.
//! 3. Forced wildcard: a `"*"` child matches the rest of the path
//!    immediately.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::message::{HttpRequest, HttpResponse};

/// A route handler: request in, response out.
pub type Handler = Arc<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

#[derive(Default)]
struct RouteNode {
    next: BTreeMap<String, RouteNode>,
    handler: Option<Handler>,
}

/// The route table.
pub struct RouteTree {
    root: RouteNode,
    default_handler: Handler,
}

impl RouteTree {
    pub fn new() -> RouteTree {
        RouteTree {
            root: RouteNode::default(),
            default_handler: Arc::new(|_| HttpResponse::not_found()),
        }
    }

    /// Handler used when nothing in the tree matches.
    pub fn set_default_handler(&mut self, handler: Handler) {
        self.default_handler = handler;
    }

    /// Register `handler` under `path`.
    pub fn insert(&mut self, path: &str, handler: Handler) {
        let mut node = &mut self.root;
        for seg in segments(path) {
            node = node.next.entry(seg.to_string()).or_default();
        }
        node.handler = Some(handler);
    }

    /// Find the handler for a request path.
    pub fn find(&self, path: &str) -> Handler {
        let mut candidate = self.default_handler.clone();
        let mut node = &self.root;

        for seg in segments(path) {
            // A "" child along the way is the prefix default for this
            // subtree
            if let Some(h) = node.next.get("").and_then(|c| c.handler.clone()) {
                candidate = h;
            }
            // "*" matches the rest of the path unconditionally
            if let Some(star) = node.next.get("*") {
                return star.handler.clone().unwrap_or(candidate);
            }
            match node.next.get(seg) {
                Some(child) => node = child,
                None => return candidate,
            }
        }
        node.handler.clone().unwrap_or(candidate)
    }
}

impl Default for RouteTree {
    fn default() -> Self {
        RouteTree::new()
    }
}

/// Split a path into segments after the leading slash. A trailing
/// slash produces a final `""` segment, which is what makes the
/// prefix-default registration work.
fn segments(path: &str) -> Vec<&str> {
    if path.is_empty() {
        return Vec::new();
    }
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    trimmed.split('/').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(tag: &'static str) -> Handler {
        Arc::new(move |_req| HttpResponse::ok(tag))
    }

    fn body_of(tree: &RouteTree, path: &str) -> String {
        let req = HttpRequest {
            url: path.to_string(),
            ..Default::default()
        };
        String::from_utf8(tree.find(path)(&req).body).unwrap()
    }

    #[test]
    fn test_exact_match() {
        let mut tree = RouteTree::new();
        tree.insert("/api/users", tagged("users"));
        tree.insert("/api/items", tagged("items"));
        assert_eq!(body_of(&tree, "/api/users"), "users");
        assert_eq!(body_of(&tree, "/api/items"), "items");
    }

    #[test]
    fn test_default_handler_for_unknown() {
        let mut tree = RouteTree::new();
        tree.insert("/known", tagged("known"));
        tree.set_default_handler(tagged("fallback"));
        assert_eq!(body_of(&tree, "/unknown"), "fallback");
        assert_eq!(body_of(&tree, "/"), "fallback");
    }

    #[test]
    fn test_trailing_slash_is_prefix_default() {
        let mut tree = RouteTree::new();
        tree.insert("/docs/", tagged("docs-root"));
        tree.insert("/docs/api", tagged("docs-api"));
        assert_eq!(body_of(&tree, "/docs/api"), "docs-api");
        // Anything else under /docs falls back to the prefix default
        assert_eq!(body_of(&tree, "/docs/guide"), "docs-root");
    }

    #[test]
    fn test_wildcard_forces_match() {
        let mut tree = RouteTree::new();
        tree.insert("/static/*", tagged("static"));
        assert_eq!(body_of(&tree, "/static/css/site.css"), "static");
        assert_eq!(body_of(&tree, "/static/anything"), "static");
    }

    #[test]
    fn test_deeper_path_than_route_falls_back() {
        let mut tree = RouteTree::new();
        tree.insert("/a", tagged("a"));
        tree.set_default_handler(tagged("fallback"));
        assert_eq!(body_of(&tree, "/a/b/c"), "fallback");
    }
}
