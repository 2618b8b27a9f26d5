//! Reversible encoding of origin URLs as proxy references.
//!
//! A reference is the configured proxy base plus a single `url` query
//! parameter carrying the full form-urlencoded origin URL:
//! `https://relay.example/proxy?url=https%3A%2F%2Forigin.example%2Fseg0.ts`.

use url::{Url, form_urlencoded};

/// Query parameter carrying the origin URL.
pub const TARGET_PARAM: &str = "url";

#[derive(Clone, Debug)]
pub struct ProxyCodec {
    base: String,
}

impl ProxyCodec {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        let base = base.trim_end_matches(['?', '&']).to_string();
        Self { base }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn separator(&self) -> char {
        if self.base.contains('?') { '&' } else { '?' }
    }

    /// Encode an absolute origin URL as a proxy reference.
    pub fn encode(&self, target: &Url) -> String {
        let value: String = form_urlencoded::byte_serialize(target.as_str().as_bytes()).collect();
        format!("{}{}{}={}", self.base, self.separator(), TARGET_PARAM, value)
    }

    /// Append `params` to every reference in `text` produced by [`encode`].
    ///
    /// A reference ends where the form-urlencoded value does, so references
    /// on URI lines and inside quoted `URI="..."` attributes are both found.
    ///
    /// [`encode`]: ProxyCodec::encode
    pub fn append_params(&self, text: &str, params: &[(String, String)]) -> String {
        if params.is_empty() {
            return text.to_string();
        }

        let suffix: String = params
            .iter()
            .map(|(k, v)| {
                let mut pair = form_urlencoded::Serializer::new(String::new());
                pair.append_pair(k, v);
                format!("&{}", pair.finish())
            })
            .collect();
        let marker = format!("{}{}{}=", self.base, self.separator(), TARGET_PARAM);

        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(pos) = rest.find(&marker) {
            let value_start = pos + marker.len();
            let value_len = rest[value_start..]
                .bytes()
                .take_while(|b| is_encoded_byte(*b))
                .count();
            let end = value_start + value_len;
            out.push_str(&rest[..end]);
            out.push_str(&suffix);
            rest = &rest[end..];
        }
        out.push_str(rest);
        out
    }

    /// Recover the origin URL from a reference produced by [`encode`].
    ///
    /// [`encode`]: ProxyCodec::encode
    pub fn decode(&self, reference: &str) -> Option<String> {
        let (_, query) = reference.split_once('?')?;
        form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == TARGET_PARAM)
            .map(|(_, v)| v.into_owned())
    }
}

/// Bytes `form_urlencoded::byte_serialize` can emit.
fn is_encoded_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'*' | b'-' | b'.' | b'_' | b'+' | b'%')
}
