use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
};

use crate::defense::{Notice, Verdict};

pub const NOTICE_COOKIE: &str = "notice";
pub const SESSION_COOKIE: &str = "sessionid";

const BLOCKED_PAGE: &str =
    r#"<center><h1 style="margin-top: 50px;">You have been blocked from this site</h1></center>"#;

/// Static page for blocked clients. Says nothing about why or for how long.
pub fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, Html(BLOCKED_PAGE)).into_response()
}

pub fn failure_page() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("<p>{}</p>", Notice::SomethingWrong.message())),
    )
        .into_response()
}

pub fn redirect(to: &str, notice: Option<Notice>) -> Response {
    let mut response = Redirect::to(to).into_response();
    if let Some(notice) = notice {
        set_notice(&mut response, notice);
    }
    response
}

pub fn set_notice(response: &mut Response, notice: Notice) {
    let encoded: String = url::form_urlencoded::byte_serialize(notice.message().as_bytes()).collect();
    let cookie = format!("{NOTICE_COOKIE}={encoded}; Path=/; Max-Age=60; SameSite=Lax");
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
}

pub fn clear_session(response: &mut Response) {
    let cookie = format!("{SESSION_COOKIE}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax");
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
}

/// The response a short-circuiting verdict stands for.
pub fn from_verdict(verdict: Verdict) -> Option<Response> {
    match verdict {
        Verdict::Continue => None,
        Verdict::Forbidden => Some(forbidden()),
        Verdict::Redirect { to, notice } => Some(redirect(&to, notice)),
    }
}

/// Value of cookie `name` from the request's `Cookie` headers.
pub fn cookie(headers: &axum::http::HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn redirects_carry_notices() {
        let response = redirect("/logout", Some(Notice::BlockWarning));

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/logout");
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("notice=WARNING%21%21"));
    }

    #[test]
    fn reads_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("a=1; sessionid=abc"));

        assert_eq!(cookie(&headers, SESSION_COOKIE), Some("abc".to_string()));
        assert_eq!(cookie(&headers, "missing"), None);
    }
}
