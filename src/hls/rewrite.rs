use crate::{
    error::{ProxyError, Result},
    hls::manifest::{Manifest, ManifestKind},
    proxy::{codec::ProxyCodec, resolver::Resolver},
};
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

/// One rewritten reference: the absolute origin URL and what replaced it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RewriteRecord {
    pub original: String,
    pub rewritten: String,
}

#[derive(Debug)]
pub struct RewriteOutput {
    pub kind: ManifestKind,
    pub text: String,
    pub records: Vec<RewriteRecord>,
}

/// Parse `manifest_text`, point every reference URI back at the proxy and
/// serialize the result.
///
/// Relative references are resolved against `final_url`, the URL the origin
/// actually answered from after redirects. Host policy is not applied here:
/// a disallowed host is rejected when the client follows the reference.
/// References with a non-http scheme (`data:`, `skd:`) are left as they are.
pub fn rewrite_manifest(
    manifest_text: &str,
    final_url: &Url,
    resolver: &Resolver,
    codec: &ProxyCodec,
) -> Result<RewriteOutput> {
    let mut manifest = Manifest::parse(manifest_text)?;
    let kind = manifest.kind();
    let mut records = Vec::with_capacity(manifest.reference_count());

    for uri in manifest.uris_mut() {
        if has_foreign_scheme(uri) {
            debug!("Leaving non-http reference untouched: {}", uri);
            continue;
        }

        let absolute = resolver
            .join(uri, final_url)
            .map_err(|e| ProxyError::ParseError(format!("unresolvable reference '{uri}': {e}")))?;
        let rewritten = codec.encode(&absolute);

        debug!("Rewrote {} -> {}", absolute, rewritten);
        records.push(RewriteRecord {
            original: absolute.to_string(),
            rewritten: rewritten.clone(),
        });
        *uri = rewritten;
    }

    info!(
        "Rewrote {} {} playlist references for {}",
        records.len(),
        kind.as_str(),
        final_url
    );

    Ok(RewriteOutput {
        kind,
        text: manifest.serialize(),
        records,
    })
}

/// `true` for absolute URIs whose scheme the proxy does not relay.
fn has_foreign_scheme(uri: &str) -> bool {
    match Url::parse(uri) {
        Ok(url) => !matches!(url.scheme(), "http" | "https"),
        Err(_) => false,
    }
}
