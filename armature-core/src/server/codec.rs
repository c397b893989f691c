//! Content codecs
//!
//! A registry of body decoders and encoders keyed by MIME type. Decoders
//! turn the raw request body into one tagged [`Body`] value per declared
//! handler parameter; encoders turn the handler's return values into the
//! response payload. Negotiation honors an explicit handler-set
//! Content-Type, then walks the `Accept` header, and falls back to JSON.

use super::routes::ParamKind;
use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use std::collections::HashMap;

/// MIME type used when negotiation finds nothing better.
pub const DEFAULT_MIME: &str = "application/json";

/// Tagged body value passed between codecs and handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Explicit `null` payload; handlers see the zero value.
    Null,
    /// Structured payload.
    Json(Value),
    /// Opaque bytes (octet-stream codecs).
    Raw(Vec<u8>),
}

impl Body {
    /// View as a JSON value; raw bytes become a number array, null is null.
    pub fn to_value(&self) -> Value {
        match self {
            Body::Null => Value::Null,
            Body::Json(value) => value.clone(),
            Body::Raw(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        }
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        if value.is_null() {
            Body::Null
        } else {
            Body::Json(value)
        }
    }
}

pub type DecodeFn = fn(&[u8], &[ParamKind]) -> Result<Vec<Body>>;
pub type EncodeFn = fn(&[Body]) -> Result<Vec<u8>>;

/// MIME-keyed decoder/encoder registry, owned by the server.
pub struct CodecRegistry {
    decoders: HashMap<String, DecodeFn>,
    encoders: HashMap<String, EncodeFn>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self { decoders: HashMap::new(), encoders: HashMap::new() };

        registry.register_decoder("application/json", json_decode);
        registry.register_decoder("text/json", json_decode);
        registry.register_decoder("application/xml", xml_decode_body);
        registry.register_decoder("text/xml", xml_decode_body);
        registry.register_decoder("application/octet-stream", raw_decode);
        registry.register_decoder("application/grpc+octet-stream", raw_decode);
        // reserved; files are pulled lazily through the context
        registry.register_decoder("multipart/form-data", multipart_decode);

        registry.register_encoder("application/json", json_encode);
        registry.register_encoder("text/json", json_encode);
        registry.register_encoder("application/xml", xml_encode_body);
        registry.register_encoder("text/xml", xml_encode_body);
        registry.register_encoder("application/octet-stream", raw_encode);
        registry.register_encoder("application/grpc+octet-stream", raw_encode);

        registry
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_decoder(&mut self, mime: &str, decode: DecodeFn) {
        self.decoders.insert(mime.to_string(), decode);
    }

    pub fn register_encoder(&mut self, mime: &str, encode: EncodeFn) {
        self.encoders.insert(mime.to_string(), encode);
    }

    /// Decoder for a Content-Type header value (parameters stripped).
    pub fn decoder(&self, content_type: &str) -> Option<DecodeFn> {
        self.decoders.get(strip_params(content_type)).copied()
    }

    /// Pick the response encoder: an explicit handler-set Content-Type wins,
    /// then the first registered `Accept` entry, then JSON.
    pub fn negotiate(&self, accept: Option<&str>, explicit: Option<&str>) -> (String, EncodeFn) {
        if let Some(explicit) = explicit {
            let mime = strip_params(explicit);
            if let Some(encode) = self.encoders.get(mime) {
                return (mime.to_string(), *encode);
            }
        }

        if let Some(accept) = accept {
            for entry in accept.split([';', ',']) {
                let mime = entry.trim();
                if mime.is_empty() || mime.starts_with("q=") {
                    continue;
                }
                if mime == "*/*" {
                    break;
                }
                if let Some(encode) = self.encoders.get(mime) {
                    return (mime.to_string(), *encode);
                }
            }
        }

        let fallback = self.encoders[DEFAULT_MIME];
        (DEFAULT_MIME.to_string(), fallback)
    }
}

fn strip_params(mime: &str) -> &str {
    mime.split(';').next().unwrap_or(mime).trim()
}

// JSON

fn json_decode(data: &[u8], params: &[ParamKind]) -> Result<Vec<Body>> {
    if params.is_empty() {
        return Ok(Vec::new());
    }

    // with several parameters, an array body distributes element i to
    // parameter i
    if params.len() > 1 && data.trim_ascii_start().starts_with(b"[") {
        let items: Vec<Value> =
            serde_json::from_slice(data).map_err(|_| anyhow!("invalid input"))?;
        if items.len() != params.len() {
            bail!("invalid number of input parameters");
        }
        return Ok(items.into_iter().map(Body::from).collect());
    }

    let value: Value = serde_json::from_slice(data).map_err(|_| anyhow!("invalid input"))?;
    Ok(std::iter::repeat(value).map(Body::from).take(params.len()).collect())
}

fn json_encode(values: &[Body]) -> Result<Vec<u8>> {
    let out = match values {
        [single] => serde_json::to_vec(&single.to_value())?,
        many => serde_json::to_vec(&many.iter().map(Body::to_value).collect::<Vec<_>>())?,
    };
    Ok(out)
}

// Raw octet streams

fn raw_decode(data: &[u8], params: &[ParamKind]) -> Result<Vec<Body>> {
    if data == b"null" {
        return Ok(vec![Body::Null; params.len()]);
    }
    Ok(vec![Body::Raw(data.to_vec()); params.len()])
}

fn raw_encode(values: &[Body]) -> Result<Vec<u8>> {
    match values {
        [Body::Raw(bytes)] => Ok(bytes.clone()),
        [single] => Ok(bincode::serialize(&single.to_value())?),
        many => {
            // raw members pass through untouched, structured ones are
            // bincode-framed
            let mut out = Vec::new();
            for value in many {
                match value {
                    Body::Raw(bytes) => out.extend_from_slice(bytes),
                    other => out.extend(bincode::serialize(&other.to_value())?),
                }
            }
            Ok(out)
        }
    }
}

fn multipart_decode(_data: &[u8], _params: &[ParamKind]) -> Result<Vec<Body>> {
    Ok(Vec::new())
}

// XML
//
// A compact element mapping: children become object fields (repeated names
// collapse into arrays), text-only elements become strings. Attributes are
// not modeled.

fn xml_decode_body(data: &[u8], params: &[ParamKind]) -> Result<Vec<Body>> {
    if params.is_empty() {
        return Ok(Vec::new());
    }
    if data == b"null" {
        return Ok(vec![Body::Null; params.len()]);
    }
    let text = std::str::from_utf8(data).map_err(|_| anyhow!("invalid input"))?;
    let value = xml_to_value(text).map_err(|_| anyhow!("invalid input"))?;
    Ok(vec![Body::Json(value); params.len()])
}

fn xml_encode_body(values: &[Body]) -> Result<Vec<u8>> {
    let mut out = String::new();
    match values {
        [single] => value_to_xml("result", &single.to_value(), &mut out),
        many => {
            out.push_str("<results>");
            for value in many {
                value_to_xml("result", &value.to_value(), &mut out);
            }
            out.push_str("</results>");
        }
    }
    Ok(out.into_bytes())
}

fn value_to_xml(tag: &str, value: &Value, out: &mut String) {
    match value {
        Value::Null => {
            out.push('<');
            out.push_str(tag);
            out.push_str("/>");
        }
        Value::Array(items) => {
            for item in items {
                value_to_xml(tag, item, out);
            }
        }
        Value::Object(map) => {
            out.push('<');
            out.push_str(tag);
            out.push('>');
            for (key, item) in map {
                value_to_xml(key, item, out);
            }
            out.push_str("</");
            out.push_str(tag);
            out.push('>');
        }
        scalar => {
            out.push('<');
            out.push_str(tag);
            out.push('>');
            let text = match scalar {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&xml_escape(&text));
            out.push_str("</");
            out.push_str(tag);
            out.push('>');
        }
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn xml_unescape(text: &str) -> String {
    text.replace("&lt;", "<").replace("&gt;", ">").replace("&quot;", "\"").replace("&amp;", "&")
}

/// Parse a document and return the root element's value.
fn xml_to_value(text: &str) -> Result<Value> {
    let mut parser = XmlParser { input: text.as_bytes(), pos: 0 };
    parser.skip_prolog();
    let (_, value) = parser.element()?;
    Ok(value)
}

struct XmlParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> XmlParser<'a> {
    fn skip_ws(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn skip_prolog(&mut self) {
        loop {
            self.skip_ws();
            if self.rest().starts_with("<?") {
                self.advance_past("?>");
            } else if self.rest().starts_with("<!--") {
                self.advance_past("-->");
            } else {
                return;
            }
        }
    }

    fn rest(&self) -> &str {
        std::str::from_utf8(&self.input[self.pos..]).unwrap_or("")
    }

    fn advance_past(&mut self, token: &str) {
        match self.rest().find(token) {
            Some(idx) => self.pos += idx + token.len(),
            None => self.pos = self.input.len(),
        }
    }

    /// Parse `<tag>...</tag>` or `<tag/>`, returning the tag name and value.
    fn element(&mut self) -> Result<(String, Value)> {
        self.skip_ws();
        if self.pos >= self.input.len() || self.input[self.pos] != b'<' {
            bail!("expected element");
        }
        self.pos += 1;
        let name_end = self
            .rest()
            .find(|c: char| c.is_ascii_whitespace() || c == '>' || c == '/')
            .ok_or_else(|| anyhow!("unterminated tag"))?;
        let name = self.rest()[..name_end].to_string();
        if name.is_empty() {
            bail!("empty tag name");
        }
        self.pos += name_end;

        // skip attributes up to the tag close
        let close = self.rest().find('>').ok_or_else(|| anyhow!("unterminated tag"))?;
        let self_closing = self.rest()[..close].ends_with('/');
        self.pos += close + 1;

        if self_closing {
            return Ok((name, Value::Null));
        }

        let mut fields: Vec<(String, Value)> = Vec::new();
        let mut text = String::new();
        loop {
            self.skip_ws();
            if self.rest().starts_with("</") {
                self.advance_past(">");
                break;
            }
            if self.rest().starts_with("<!--") {
                self.advance_past("-->");
                continue;
            }
            if self.rest().starts_with('<') {
                let (child, value) = self.element()?;
                fields.push((child, value));
                continue;
            }
            if self.pos >= self.input.len() {
                bail!("unterminated element {}", name);
            }
            let chunk = self.rest().find('<').unwrap_or(self.rest().len());
            text.push_str(self.rest()[..chunk].trim());
            self.pos += chunk;
        }

        if fields.is_empty() {
            return Ok((name, Value::String(xml_unescape(&text))));
        }
        // repeated child names collapse into arrays
        let mut map = serde_json::Map::new();
        for (key, value) in fields {
            match map.get_mut(&key) {
                Some(Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let first = existing.take();
                    map.insert(key, Value::Array(vec![first, value]));
                }
                None => {
                    map.insert(key, value);
                }
            }
        }
        Ok((name, Value::Object(map)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ONE: &[ParamKind] = &[ParamKind::Object];
    const TWO: &[ParamKind] = &[ParamKind::Object, ParamKind::Object];

    #[test]
    fn json_single_param_gets_whole_body() {
        let out = json_decode(br#"{"a":1}"#, ONE).unwrap();
        assert_eq!(out, vec![Body::Json(json!({"a": 1}))]);
    }

    #[test]
    fn json_array_distributes_to_params() {
        let out = json_decode(br#"[{"a":1}, "two"]"#, TWO).unwrap();
        assert_eq!(out, vec![Body::Json(json!({"a": 1})), Body::Json(json!("two"))]);
    }

    #[test]
    fn json_array_arity_mismatch_fails() {
        assert!(json_decode(br#"[1, 2, 3]"#, TWO).is_err());
    }

    #[test]
    fn json_null_yields_zero_value() {
        let out = json_decode(b"null", ONE).unwrap();
        assert_eq!(out, vec![Body::Null]);
    }

    #[test]
    fn json_garbage_is_invalid_input() {
        let err = json_decode(b"{nope", ONE).unwrap_err();
        assert_eq!(err.to_string(), "invalid input");
    }

    #[test]
    fn json_encode_single_vs_list() {
        let single = json_encode(&[Body::Json(json!("hello"))]).unwrap();
        assert_eq!(single, br#""hello""#);

        let double = json_encode(&[Body::Json(json!(1)), Body::Json(json!(2))]).unwrap();
        assert_eq!(double, b"[1,2]");
    }

    #[test]
    fn negotiation_prefers_explicit_content_type() {
        let registry = CodecRegistry::new();
        let (mime, _) = registry.negotiate(Some("application/json"), Some("application/xml"));
        assert_eq!(mime, "application/xml");
    }

    #[test]
    fn negotiation_walks_accept() {
        let registry = CodecRegistry::new();
        let (mime, _) = registry.negotiate(Some("text/html; application/xml"), None);
        assert_eq!(mime, "application/xml");
    }

    #[test]
    fn negotiation_falls_back_to_json() {
        let registry = CodecRegistry::new();
        assert_eq!(registry.negotiate(Some("*/*"), None).0, DEFAULT_MIME);
        assert_eq!(registry.negotiate(None, None).0, DEFAULT_MIME);
        assert_eq!(registry.negotiate(Some("text/html"), None).0, DEFAULT_MIME);
    }

    #[test]
    fn raw_roundtrip() {
        let out = raw_decode(&[1, 2, 3], ONE).unwrap();
        assert_eq!(out, vec![Body::Raw(vec![1, 2, 3])]);
        assert_eq!(raw_encode(&out).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn xml_decode_nested() {
        let value = xml_to_value("<user><name>alice</name><age>30</age></user>").unwrap();
        assert_eq!(value, json!({"name": "alice", "age": "30"}));
    }

    #[test]
    fn xml_decode_repeated_children() {
        let value = xml_to_value("<list><item>a</item><item>b</item></list>").unwrap();
        assert_eq!(value, json!({"item": ["a", "b"]}));
    }

    #[test]
    fn xml_decode_with_prolog_and_escapes() {
        let value = xml_to_value("<?xml version=\"1.0\"?><msg>a &amp; b</msg>").unwrap();
        assert_eq!(value, json!("a & b"));
    }

    #[test]
    fn xml_decode_malformed_fails() {
        assert!(xml_to_value("<open").is_err());
        assert!(xml_to_value("no tags").is_err());
    }

    #[test]
    fn xml_encode_object() {
        let out = xml_encode_body(&[Body::Json(json!({"error": "boom"}))]).unwrap();
        assert_eq!(out, b"<result><error>boom</error></result>");
    }
}
