//! Server-rendered pages. Both pages are plain `format!` templates with the
//! stylesheet and client script embedded at compile time, so the binary
//! serves the whole UI without touching the filesystem.

const BASE_CSS: &str = include_str!("ui_assets/base.css");
const LOGIN_CSS: &str = include_str!("ui_assets/login.css");
const INDEX_JS: &str = include_str!("ui_assets/index.js");

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn escape_html_attr(input: &str) -> String {
    escape_html(input)
}

fn render_document(
    title: &str,
    css: &str,
    body_class: &str,
    body: &str,
    script: Option<&str>,
) -> String {
    let class_attr = if body_class.is_empty() {
        String::new()
    } else {
        format!(" class=\"{body_class}\"")
    };
    let script_tag = script
        .map(|js| format!("<script>{js}</script>\n"))
        .unwrap_or_default();
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n<title>{title}</title>\n<style>{css}</style>\n</head>\n<body{class_attr}>\n{body}\n{script_tag}</body>\n</html>\n"
    )
}

pub fn render_login_page(error: bool) -> String {
    let error_html = if error {
        "<p class=\"error\">Wrong username or password.</p>"
    } else {
        ""
    };
    let body = format!(
        r#"<main class="card">
<h1>rdgrab</h1>
<p class="tagline">Feed watcher for Real-Debrid</p>
{error_html}
<form method="post" action="/login">
<label for="username">Username</label>
<input id="username" name="username" autocomplete="username" autofocus required>
<label for="password">Password</label>
<input id="password" name="password" type="password" autocomplete="current-password" required>
<button type="submit">Sign in</button>
</form>
</main>"#
    );
    render_document("rdgrab login", LOGIN_CSS, "login", &body, None)
}

pub fn render_index_page(
    feeds: &[String],
    rd_api_key: &str,
    seen_count: usize,
    poll_interval_seconds: u64,
    notice: Option<&str>,
) -> String {
    let feed_rows = if feeds.is_empty() {
        "<li class=\"empty\">No feeds yet.</li>".to_string()
    } else {
        feeds
            .iter()
            .enumerate()
            .map(|(index, url)| {
                format!(
                    "<li><code>{}</code><button type=\"button\" class=\"remove\" data-index=\"{index}\">Remove</button></li>",
                    escape_html(url)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let notice_html = notice
        .map(|text| format!("<div class=\"notice\">{}</div>", escape_html(text)))
        .unwrap_or_default();

    let interval = if poll_interval_seconds % 60 == 0 {
        format!("{} min", poll_interval_seconds / 60)
    } else {
        format!("{poll_interval_seconds} s")
    };

    let body = format!(
        r#"<header>
<h1>rdgrab</h1>
<nav>
<details class="menu">
<summary>Account</summary>
<div class="menu-panel">
<form method="post" action="/change_password" class="stacked">
<label for="new-password">New password</label>
<input id="new-password" name="new_password" type="password" autocomplete="new-password" required>
<button type="submit">Change password</button>
</form>
<a href="/logout"><button type="button" class="ghost">Log out</button></a>
</div>
</details>
</nav>
</header>
<main>
{notice_html}
<section>
<h2>Feeds</h2>
<ul id="feed-list">
{feed_rows}
</ul>
<form id="add-feed-form" class="inline">
<input id="feed-url" type="url" placeholder="https://example.com/rss" required>
<button type="submit">Add feed</button>
</form>
</section>
<section>
<h2>Real-Debrid</h2>
<form id="settings-form" class="inline">
<input id="rd-api-key" value="{api_key}" placeholder="API key from real-debrid.com/apitoken">
<button type="submit">Save key</button>
</form>
<p class="hint">{seen_count} magnet links recorded as submitted. Feeds are checked automatically every {interval}.</p>
<button id="refresh-button" type="button">Check feeds now</button>
<pre id="refresh-output" hidden></pre>
</section>
<section>
<h2>API console</h2>
<form id="api-form" class="inline">
<select id="api-method"></select>
<input id="api-arg" placeholder="argument">
<button type="submit">Call</button>
</form>
<p class="hint">Avatar upload/delete and account setting updates take extra parameters; call <code>/api/avatar</code> and <code>/api/update_user_settings</code> directly.</p>
<pre id="api-output" hidden></pre>
</section>
</main>"#,
        api_key = escape_html_attr(rd_api_key),
    );

    render_document("rdgrab", BASE_CSS, "", &body, Some(INDEX_JS))
}
