//! Adapters that turn a concrete transport into the [`Input`](crate::module::Input) /
//! [`Output`](crate::module::Output) capabilities consumed by modules.

pub mod axum_host;
pub mod memory;

use percent_encoding::percent_decode_str;

/// First value of `key` in a raw `application/x-www-form-urlencoded` query string.
pub(crate) fn query_value(raw_query: &str, key: &str) -> Option<String> {
    for param in raw_query.split('&') {
        let (k, v) = param.split_once('=').unwrap_or((param, ""));
        if decode_component(k) == key {
            return Some(decode_component(v));
        }
    }
    None
}

fn decode_component(s: &str) -> String {
    let s = s.replace('+', " ");
    percent_decode_str(&s).decode_utf8_lossy().into_owned()
}

/// Value of the named cookie in a `Cookie` header value.
pub(crate) fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then(|| v.trim_matches('"').to_string())
    })
}
