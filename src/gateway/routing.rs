//! Ordered service table mapping request paths to gateway operations.
//!
//! Patterns are tried in table order and the first match wins, so the specific
//! `objects/info/packs` route is listed before the generic `objects/info/*` one.

use std::sync::LazyLock;

use axum::http::Method;
use regex::Regex;

use crate::protocol::ServiceType;

/// Handler operation selected by a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Stream a stateless RPC through the git binary.
    ServiceRpc(ServiceType),
    /// `info/refs`, smart advertisement or dumb fallback.
    InfoRefs,
    /// Small uncacheable text files (`HEAD`, alternates, `objects/info/*`).
    TextFile,
    InfoPacks,
    LooseObject,
    PackFile,
    IdxFile,
}

/// Service descriptor: the method a route accepts and what it does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub method: Method,
    pub operation: Operation,
}

impl Service {
    pub fn rpc(&self) -> Option<ServiceType> {
        match self.operation {
            Operation::ServiceRpc(service) => Some(service),
            _ => None,
        }
    }
}

struct Route {
    pattern: Regex,
    service: Service,
}

fn route(pattern: &str, method: Method, operation: Operation) -> Route {
    Route {
        pattern: Regex::new(pattern).expect("static route pattern"),
        service: Service { method, operation },
    }
}

static ROUTES: LazyLock<Vec<Route>> = LazyLock::new(|| {
    use Operation::*;
    vec![
        route(
            "(.*?)/git-upload-pack$",
            Method::POST,
            ServiceRpc(ServiceType::UploadPack),
        ),
        route(
            "(.*?)/git-receive-pack$",
            Method::POST,
            ServiceRpc(ServiceType::ReceivePack),
        ),
        route("(.*?)/info/refs$", Method::GET, InfoRefs),
        route("(.*?)/HEAD$", Method::GET, TextFile),
        route("(.*?)/objects/info/alternates$", Method::GET, TextFile),
        route("(.*?)/objects/info/http-alternates$", Method::GET, TextFile),
        route("(.*?)/objects/info/packs$", Method::GET, InfoPacks),
        route("(.*?)/objects/info/[^/]*$", Method::GET, TextFile),
        route(
            "(.*?)/objects/[0-9a-f]{2}/[0-9a-f]{38}$",
            Method::GET,
            LooseObject,
        ),
        route(
            r"(.*?)/objects/pack/pack-[0-9a-f]{40}\.pack$",
            Method::GET,
            PackFile,
        ),
        route(
            r"(.*?)/objects/pack/pack-[0-9a-f]{40}\.idx$",
            Method::GET,
            IdxFile,
        ),
    ]
});

/// A matched route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub service: &'static Service,
    /// Repository part of the path, e.g. `/team/project.git`.
    pub repo: String,
    /// Path of the requested file relative to the repository.
    pub file: String,
}

/// Finds the first route matching `path`.
pub fn match_route(path: &str) -> Option<RouteMatch> {
    ROUTES.iter().find_map(|route| {
        let captures = route.pattern.captures(path)?;
        let repo = captures.get(1).map_or("", |m| m.as_str()).to_string();
        let file = path.replacen(&format!("{repo}/"), "", 1);
        Some(RouteMatch {
            service: &route.service,
            repo,
            file,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(path: &str) -> Option<Operation> {
        match_route(path).map(|m| m.service.operation)
    }

    #[test]
    fn matches_every_service() {
        let id = "0123456789abcdef0123456789abcdef01234567";
        let cases = [
            ("/r.git/git-upload-pack", Operation::ServiceRpc(ServiceType::UploadPack)),
            ("/r.git/git-receive-pack", Operation::ServiceRpc(ServiceType::ReceivePack)),
            ("/r.git/info/refs", Operation::InfoRefs),
            ("/r.git/HEAD", Operation::TextFile),
            ("/r.git/objects/info/alternates", Operation::TextFile),
            ("/r.git/objects/info/http-alternates", Operation::TextFile),
            ("/r.git/objects/info/commit-graph", Operation::TextFile),
            ("/r.git/objects/ab/cdef0123456789abcdef0123456789abcdef01", Operation::LooseObject),
        ];
        for (path, want) in cases {
            assert_eq!(op(path), Some(want), "{path}");
        }
        assert_eq!(op(&format!("/r.git/objects/pack/pack-{id}.pack")), Some(Operation::PackFile));
        assert_eq!(op(&format!("/r.git/objects/pack/pack-{id}.idx")), Some(Operation::IdxFile));
    }

    /// `objects/info/packs` resolves to its own operation, not the generic info-file route.
    #[test]
    fn specific_route_wins() {
        assert_eq!(op("/r.git/objects/info/packs"), Some(Operation::InfoPacks));
    }

    #[test]
    fn extracts_repo_and_file() {
        let m = match_route("/team/project.git/info/refs").unwrap();
        assert_eq!(m.repo, "/team/project.git");
        assert_eq!(m.file, "info/refs");
        assert_eq!(m.service.method, Method::GET);
        assert_eq!(m.service.rpc(), None);

        let m = match_route("/git-upload-pack").unwrap();
        assert_eq!(m.repo, "");
        assert_eq!(m.file, "git-upload-pack");
        assert_eq!(m.service.rpc(), Some(ServiceType::UploadPack));
    }

    #[test]
    fn rejects_unknown_paths() {
        assert!(match_route("/r.git/objects/ab/short").is_none());
        assert!(match_route("/r.git/objects/AB/CDEF0123456789ABCDEF0123456789ABCDEF01").is_none());
        assert!(match_route("/r.git/description").is_none());
        assert!(match_route("/r.git/git-upload-pack/extra").is_none());
    }
}
