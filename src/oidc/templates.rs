//! HTML pages for the interactive parts of the flow

use super::error::OidcError;

const STYLE: &str = r#"<style>
body { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif; background: #f4f5f7; margin: 0; }
.card { max-width: 380px; margin: 80px auto; background: #fff; border-radius: 8px; padding: 32px; box-shadow: 0 1px 4px rgba(0,0,0,.12); }
h1 { font-size: 20px; margin: 0 0 16px; }
label { display: block; font-size: 13px; margin: 12px 0 4px; color: #444; }
input { width: 100%; box-sizing: border-box; padding: 8px; border: 1px solid #ccc; border-radius: 4px; }
button { margin-top: 20px; width: 100%; padding: 10px; border: 0; border-radius: 4px; background: #ec7211; color: #fff; font-size: 15px; cursor: pointer; }
.hint { font-size: 12px; color: #777; margin-top: 12px; }
.error { color: #b00020; font-size: 13px; }
a { color: #0073bb; }
</style>"#;

/// Escape text for HTML element and attribute content
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn page(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title}</title>
{STYLE}
</head>
<body>
<div class="card">
{body}
</div>
</body>
</html>"#,
        title = escape_html(title),
    )
}

/// Login form for a pending interaction
pub fn render_login_page(uid: &str, client_id: &str, scopes: &[String], error: Option<&str>) -> String {
    let uid = escape_html(uid);
    let error_html = error
        .map(|e| format!(r#"<p class="error">{}</p>"#, escape_html(e)))
        .unwrap_or_default();
    let body = format!(
        r#"<h1>Sign in</h1>
{error_html}
<form method="post" action="/interaction/{uid}/login" autocomplete="off">
<label for="login">Username</label>
<input id="login" name="login" required autofocus>
<label for="password">Password</label>
<input id="password" name="password" type="password" placeholder="any value">
<button type="submit">Sign in</button>
</form>
<p class="hint">Client <code>{client}</code> requests <code>{scope}</code>. Append groups with <code>+</code>, e.g. <code>alice+admins</code>.</p>
<p class="hint"><a href="/interaction/{uid}/abort">Cancel</a></p>"#,
        client = escape_html(client_id),
        scope = escape_html(&scopes.join(" ")),
    );
    page("Sign in", &body)
}

pub fn render_error_page(error: &OidcError) -> String {
    let body = format!(
        r#"<h1>Oops! Something went wrong</h1>
<p class="error">{code}</p>
<p>{description}</p>"#,
        code = escape_html(error.error_code()),
        description = escape_html(&error.description()),
    );
    page("Error", &body)
}

pub fn render_logged_out_page() -> String {
    page(
        "Signed out",
        "<h1>Signed out</h1>\n<p>Your session has ended.</p>",
    )
}
