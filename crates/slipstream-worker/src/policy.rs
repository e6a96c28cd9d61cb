//! Per-request interception policy.
//!
//! Decision order for every intercepted request:
//!
//! 1. offline + mutating (or retry-eligible) → queue it, answer with the
//!    offline fallback
//! 2. snapshot lookup in the current generation
//! 3. route-like miss → retry the lookup against the index document
//! 4. network pass-through, falling back to the offline document
//!
//! No path out of here raises an error to the caller; the worst case is
//! always the offline fallback response.

use bytes::Bytes;
use slipstream_cache::clean_redirect;
use slipstream_fetch::{FetchedResponse, Request};
use tracing::{debug, error, trace, warn};

use crate::WorkerContext;

/// Whether a path looks like an application route rather than a file.
///
/// Heuristic: the final path segment has no `.xxx`-style suffix.
pub fn is_route_like(path: &str) -> bool {
    let last = path.rsplit('/').next().unwrap_or(path);
    !last.contains('.')
}

/// Serve an intercepted request.
pub(crate) async fn respond(ctx: &WorkerContext, request: Request) -> FetchedResponse {
    // 1. While offline, mutating traffic is captured for replay instead of
    //    being allowed to fail.
    if !ctx.is_online() && (request.is_mutating() || request.retry_eligible) {
        let url = request.url.to_string();
        match ctx.queue().enqueue(request).await {
            Ok(key) => {
                debug!(url = %url, key, "offline mutation queued");
                if ctx.config().background_retry {
                    debug!(tag = crate::RETRY_SYNC_TAG, "background retry intent registered");
                }
            }
            // The caller still gets the fallback; this entry is lost.
            Err(e) => error!(url = %url, error = %e, "failed to queue offline mutation"),
        }
        return offline_fallback(ctx).await;
    }

    // 2. Snapshot lookup.
    if let Some(response) = lookup_cleaned(ctx, request.url.as_str()).await {
        trace!(url = %request.url, "served from snapshot");
        return response;
    }

    // 3. Route-like paths are answered by the index document, so one cached
    //    shell covers every client-side route.
    if is_route_like(request.url.path()) {
        if let Ok(index_url) = ctx.config().origin.join(&ctx.config().index_path) {
            if let Some(response) = lookup_cleaned(ctx, index_url.as_str()).await {
                trace!(url = %request.url, "served index document for route");
                return response;
            }
        }
    }

    // 4. Network pass-through. An empty (null) result is not an error and
    //    gets one more attempt before giving up.
    let retry = request.try_clone();
    let url = request.url.to_string();
    match ctx.network().fetch(request).await {
        Ok(response) if !response.is_null() => response,
        Ok(_) => {
            debug!(url = %url, "null network result, retrying once");
            match retry {
                Some(request) => match ctx.network().fetch(request).await {
                    Ok(response) if !response.is_null() => response,
                    Ok(_) => offline_fallback(ctx).await,
                    Err(e) => {
                        warn!(url = %url, error = %e, "network retry failed");
                        offline_fallback(ctx).await
                    }
                },
                None => offline_fallback(ctx).await,
            }
        }
        Err(e) => {
            warn!(url = %url, error = %e, "network fetch failed");
            offline_fallback(ctx).await
        }
    }
}

/// Look up a key in the current generation, cleaning redirect-flagged
/// entries before they are handed back.
async fn lookup_cleaned(ctx: &WorkerContext, key: &str) -> Option<FetchedResponse> {
    let current = ctx.config().generation_name();
    let store = ctx.store().read().await;
    let entry = store.lookup(&current, key, &ctx.config().match_options)?;

    if entry.redirected {
        Some(clean_redirect(entry).to_response())
    } else {
        Some(entry.to_response())
    }
}

/// The response of last resort.
///
/// Prefers the cached offline document; if even that is missing, a
/// synthesized 503 keeps the contract that every request gets an answer.
pub(crate) async fn offline_fallback(ctx: &WorkerContext) -> FetchedResponse {
    if let Ok(offline_url) = ctx.config().origin.join(&ctx.config().offline_path) {
        if let Some(response) = lookup_cleaned(ctx, offline_url.as_str()).await {
            return response;
        }
    }

    warn!("offline fallback document is not cached");
    FetchedResponse::new(ctx.config().offline_path.clone(), 503)
        .with_header("content-type", "text/plain")
        .with_body(Bytes::from_static(b"offline"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_like_paths() {
        assert!(is_route_like("/"));
        assert!(is_route_like("/about"));
        assert!(is_route_like("/reports/2024"));
        assert!(!is_route_like("/app.js"));
        assert!(!is_route_like("/img/icons/logo.maskable.png"));
        assert!(!is_route_like("/nested/path/data.json"));
    }
}
