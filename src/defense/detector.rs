use std::convert::Infallible;

use axum::body::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::env::PayloadLimits;

/// An opening tag, anything (newlines included), then a closing tag.
static HTML_TAGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<.*?>(?s:.*)</.*?>").unwrap_or_else(|e| panic!("invalid markup pattern: {e}"))
});

/// Body of a request as the pipeline sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Empty,
    Fields(Vec<(String, String)>),
    /// Unreadable, over a limit, or too many fields.
    Malformed(String),
}

impl Payload {
    pub fn parse(content_type: Option<&str>, body: &[u8], limits: &PayloadLimits) -> Payload {
        if body.is_empty() {
            return Payload::Empty;
        }
        if body.len() > limits.max_body_bytes {
            return Payload::Malformed(format!("body of {} bytes", body.len()));
        }

        let mime = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .unwrap_or_default();

        let fields = match mime.as_str() {
            "application/x-www-form-urlencoded" => url::form_urlencoded::parse(body)
                .into_owned()
                .collect::<Vec<(String, String)>>(),
            "application/json" => match serde_json::from_slice::<serde_json::Value>(body) {
                Ok(document) => {
                    let mut fields = vec![];
                    flatten_json("", &document, &mut fields);
                    fields
                }
                Err(e) => return Payload::Malformed(format!("invalid json: {e}")),
            },
            _ => vec![(String::new(), String::from_utf8_lossy(body).into_owned())],
        };

        if fields.len() > limits.max_fields {
            return Payload::Malformed(format!("{} fields", fields.len()));
        }
        Payload::Fields(fields)
    }

    /// Like [`Payload::parse`], but multipart bodies are split into their
    /// parts: text parts become fields, file parts are only counted.
    pub async fn read(content_type: Option<&str>, body: Bytes, limits: &PayloadLimits) -> Payload {
        match content_type {
            Some(content_type) if is_multipart(content_type) => {
                parse_multipart(content_type, body, limits).await
            }
            _ => Payload::parse(content_type, &body, limits),
        }
    }

    pub fn fields(&self) -> &[(String, String)] {
        match self {
            Payload::Fields(fields) => fields,
            _ => &[],
        }
    }
}

pub fn is_multipart(content_type: &str) -> bool {
    content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
}

async fn parse_multipart(content_type: &str, body: Bytes, limits: &PayloadLimits) -> Payload {
    if body.is_empty() {
        return Payload::Empty;
    }
    let boundary = match multer::parse_boundary(content_type) {
        Ok(boundary) => boundary,
        Err(e) => return Payload::Malformed(format!("multipart: {e}")),
    };
    let stream = futures::stream::once(async move { Ok::<Bytes, Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut fields = vec![];
    let mut files = 0;
    let mut text_bytes = 0;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Payload::Malformed(format!("multipart: {e}")),
        };
        let name = field.name().unwrap_or_default().to_string();

        if field.file_name().is_some() {
            files += 1;
            if files > limits.max_files {
                return Payload::Malformed(format!("{files} files"));
            }
            // File contents are never scanned, only read through.
            if let Err(e) = field.bytes().await {
                return Payload::Malformed(format!("multipart file {name}: {e}"));
            }
            continue;
        }

        match field.text().await {
            Ok(text) => {
                text_bytes += text.len();
                fields.push((name, text));
            }
            Err(e) => return Payload::Malformed(format!("multipart field {name}: {e}")),
        }
        if fields.len() > limits.max_fields {
            return Payload::Malformed(format!("{} fields", fields.len()));
        }
        if text_bytes > limits.max_body_bytes {
            return Payload::Malformed(format!("{text_bytes} bytes of fields"));
        }
    }

    Payload::Fields(fields)
}

fn flatten_json(prefix: &str, value: &serde_json::Value, out: &mut Vec<(String, String)>) {
    use serde_json::Value;

    let child = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}.{key}")
        }
    };

    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                flatten_json(&child(key), nested, out);
            }
        }
        Value::Array(items) => {
            for (idx, nested) in items.iter().enumerate() {
                flatten_json(&child(&idx.to_string()), nested, out);
            }
        }
        Value::String(s) => out.push((prefix.to_string(), s.clone())),
        Value::Null => out.push((prefix.to_string(), String::new())),
        other => out.push((prefix.to_string(), other.to_string())),
    }
}

pub fn contains_markup(value: &str) -> bool {
    HTML_TAGS.is_match(value)
}

/// Name of the first field carrying markup.
pub fn find_markup(fields: &[(String, String)]) -> Option<&str> {
    fields
        .iter()
        .find(|(_, value)| contains_markup(value))
        .map(|(name, _)| name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> PayloadLimits {
        PayloadLimits {
            max_body_bytes: 64,
            max_fields: 3,
            max_files: 1,
        }
    }

    const BOUNDARY: &str = "gatekeeper-boundary";

    fn multipart_content_type() -> String {
        format!("multipart/form-data; boundary={BOUNDARY}")
    }

    fn part(body: &mut Vec<u8>, name: &str, file_name: Option<&str>, data: &[u8]) {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match file_name {
            Some(file_name) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            ),
        }
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }

    fn close(body: &mut Vec<u8>) {
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    }

    #[test]
    fn markup_spanning_lines_is_found() {
        assert!(contains_markup("<script>alert(1)</script>"));
        assert!(contains_markup("hi <b>\nthere\n</b>"));
        assert!(!contains_markup("a < b and c > d"));
        assert!(!contains_markup("<br>"));
        assert!(!contains_markup("plain text"));
    }

    #[test]
    fn urlencoded_fields_are_decoded() {
        let payload = Payload::parse(
            Some("application/x-www-form-urlencoded; charset=utf-8"),
            b"name=Sam&note=%3Cb%3Ex%3C%2Fb%3E",
            &limits(),
        );

        assert_eq!(
            payload,
            Payload::Fields(vec![
                ("name".to_string(), "Sam".to_string()),
                ("note".to_string(), "<b>x</b>".to_string()),
            ])
        );
        assert_eq!(find_markup(payload.fields()), Some("note"));
    }

    #[test]
    fn json_is_flattened() {
        let payload = Payload::parse(
            Some("application/json"),
            br#"{"a":"x","b":{"c":[1,"<i>y</i>"]}}"#,
            &limits(),
        );

        assert_eq!(find_markup(payload.fields()), Some("b.c.1"));
        assert_eq!(payload.fields().len(), 3);
    }

    #[test]
    fn limits_make_payloads_malformed() {
        assert!(matches!(
            Payload::parse(Some("application/x-www-form-urlencoded"), b"a=1&b=2&c=3&d=4", &limits()),
            Payload::Malformed(_)
        ));
        assert!(matches!(
            Payload::parse(Some("application/json"), b"{not json", &limits()),
            Payload::Malformed(_)
        ));
        assert!(matches!(
            Payload::parse(None, &[b'x'; 65], &limits()),
            Payload::Malformed(_)
        ));
        assert_eq!(Payload::parse(None, b"", &limits()), Payload::Empty);
    }

    #[tokio::test]
    async fn multipart_files_are_not_scanned() {
        // arrange
        let mut body = vec![];
        part(&mut body, "name", None, b"Sam");
        part(&mut body, "photo", Some("p.jpg"), b"\x89\x00<\x01>\xff binary </\x02> tail");
        close(&mut body);

        // act
        let payload = Payload::read(Some(multipart_content_type().as_str()), Bytes::from(body), &limits()).await;

        // assert
        assert_eq!(
            payload,
            Payload::Fields(vec![("name".to_string(), "Sam".to_string())])
        );
        assert_eq!(find_markup(payload.fields()), None);
    }

    #[tokio::test]
    async fn multipart_text_parts_are_scanned() {
        // arrange
        let mut body = vec![];
        part(&mut body, "note", None, b"<b>hi</b>");
        close(&mut body);

        // act
        let payload = Payload::read(Some(multipart_content_type().as_str()), Bytes::from(body), &limits()).await;

        // assert
        assert_eq!(find_markup(payload.fields()), Some("note"));
    }

    #[tokio::test]
    async fn multipart_limits_make_payloads_malformed() {
        // arrange
        let mut too_many_fields = vec![];
        for name in ["a", "b", "c", "d"] {
            part(&mut too_many_fields, name, None, b"1");
        }
        close(&mut too_many_fields);
        let mut too_many_files = vec![];
        part(&mut too_many_files, "one", Some("1.jpg"), b"1");
        part(&mut too_many_files, "two", Some("2.jpg"), b"2");
        close(&mut too_many_files);
        let truncated = format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nno end");

        // act
        let content_type = multipart_content_type();
        let fields = Payload::read(Some(content_type.as_str()), Bytes::from(too_many_fields), &limits()).await;
        let files = Payload::read(Some(content_type.as_str()), Bytes::from(too_many_files), &limits()).await;
        let broken = Payload::read(Some(content_type.as_str()), Bytes::from(truncated), &limits()).await;
        let no_boundary = Payload::read(Some("multipart/form-data"), Bytes::from_static(b"x"), &limits()).await;

        // assert
        for payload in [fields, files, broken, no_boundary] {
            assert!(matches!(payload, Payload::Malformed(_)), "{payload:?}");
        }
    }
}
