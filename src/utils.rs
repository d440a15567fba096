//! URL helpers for negotiation and connection endpoints

use url::Url;

use crate::error::{Result, SignalRError};

/// Rewrite the scheme between the http and ws families. `ws = true` maps
/// http→ws and https→wss; `ws = false` maps the other way. URLs already in
/// the requested family pass through unchanged.
pub(crate) fn replace_scheme(mut url: Url, ws: bool) -> Result<Url> {
    let scheme = match (url.scheme(), ws) {
        ("http", true) => "ws",
        ("https", true) => "wss",
        ("ws", false) => "http",
        ("wss", false) => "https",
        _ => return Ok(url),
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalRError::Connection(format!("cannot rewrite scheme of `{url}`")))?;
    Ok(url)
}

/// The negotiation endpoint for a hub URL: `<url>/negotiate?negotiateVersion=1`
/// over http(s), preserving any existing query.
pub(crate) fn negotiate_url(url: &Url) -> Result<Url> {
    let mut out = replace_scheme(url.clone(), false)?;
    let path = format!("{}/negotiate", out.path().trim_end_matches('/'));
    out.set_path(&path);
    out.query_pairs_mut().append_pair("negotiateVersion", "1");
    Ok(out)
}

/// The WebSocket connection URL with the negotiated connection id appended
/// as an `id` query parameter.
pub(crate) fn connection_url(url: &Url, id: &str) -> Result<Url> {
    let mut out = replace_scheme(url.clone(), true)?;
    out.query_pairs_mut().append_pair("id", id);
    Ok(out)
}
