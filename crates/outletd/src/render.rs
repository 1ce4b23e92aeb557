//! Message rendering: template variable substitution, open-tracking
//! pixel injection, click-link rewriting, and the HTML shells content
//! can be wrapped in. Tracking URLs point at the public pages service
//! which serves the pixel/redirect/unsubscribe endpoints.

use fancy_regex::{Captures, Regex};
use rand::RngCore;
use sendq::TemplateKind;
use std::sync::LazyLock;
use url::form_urlencoded;

static HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href="([^"]+)""#).expect("href pattern is valid"));

/// 32 random bytes, hex encoded.
pub fn tracking_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    data_encoding::HEXLOWER.encode(&bytes)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateVars<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub tracking_token: &'a str,
    pub verification_token: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct Renderer {
    base_url: String,
}

impl Renderer {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url }
    }

    pub fn open_pixel_url(&self, token: &str) -> String {
        format!("{}/api/e/o/{token}", self.base_url)
    }

    pub fn click_url(&self, token: &str, target: &str) -> String {
        let encoded: String = form_urlencoded::byte_serialize(target.as_bytes()).collect();
        format!("{}/api/e/c/{token}?url={encoded}", self.base_url)
    }

    pub fn unsubscribe_url(&self, token: &str) -> String {
        format!("{}/api/e/u/{token}", self.base_url)
    }

    pub fn confirm_url(&self, token: &str) -> String {
        let encoded: String = form_urlencoded::byte_serialize(token.as_bytes()).collect();
        format!("{}/api/confirm-email?token={encoded}", self.base_url)
    }

    /// Replace the recognized placeholders in subject or body content.
    pub fn substitute(&self, content: &str, vars: &TemplateVars) -> String {
        let first_name = vars.name.split_whitespace().next().unwrap_or("");
        let mut content = content
            .replace("{{name}}", vars.name)
            .replace("{{first_name}}", first_name)
            .replace("{{email}}", vars.email);

        if let Some(token) = vars.verification_token {
            content = content.replace("{{confirm_url}}", &self.confirm_url(token));
        }
        if !vars.tracking_token.is_empty() {
            content = content.replace(
                "{{unsubscribe_url}}",
                &self.unsubscribe_url(vars.tracking_token),
            );
        }
        content
    }

    /// Insert the open-tracking pixel just before `</body>`, or append
    /// it when the content has no body tag.
    pub fn inject_pixel(&self, html: &str, token: &str) -> String {
        let pixel = format!(
            r#"<img src="{}" width="1" height="1" style="display:none" />"#,
            self.open_pixel_url(token)
        );
        match html.find("</body>") {
            Some(at) => format!("{}{}{}", &html[..at], pixel, &html[at..]),
            None => format!("{html}{pixel}"),
        }
    }

    /// Send every link through the click-tracking redirect. Leaves
    /// mailto:/tel: links, fragment anchors, unexpanded placeholders
    /// and links that already point at the redirect alone.
    pub fn rewrite_links(&self, html: &str, token: &str) -> String {
        HREF_RE
            .replace_all(html, |caps: &Captures| {
                let target = &caps[1];
                if target.starts_with("mailto:")
                    || target.starts_with("tel:")
                    || target.starts_with('#')
                    || target.starts_with("{{")
                    || target.contains("/api/e/c/")
                {
                    return caps[0].to_string();
                }
                format!(r#"href="{}""#, self.click_url(token, target))
            })
            .into_owned()
    }

    /// Wrap rendered content in the shell the template asks for.
    /// Marketing mail gets an unsubscribe link in the footer.
    pub fn wrap(
        &self,
        kind: TemplateKind,
        content: &str,
        transactional: bool,
        token: &str,
    ) -> String {
        match kind {
            TemplateKind::None => content.to_string(),
            TemplateKind::Simple => {
                let footer = self.footer(transactional, token);
                format!(
                    r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
        body {{ font-family: Arial, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px; }}
        .footer {{ text-align: center; color: #6b7280; font-size: 12px; padding: 30px 0 10px 0; border-top: 1px solid #e5e7eb; margin-top: 30px; }}
        .footer a {{ color: #6b7280; }}
        p {{ margin: 0 0 16px 0; }}
        a {{ color: #f97316; }}
    </style>
</head>
<body>
    {content}
    <div class="footer">
        {footer}
    </div>
</body>
</html>"#
                )
            }
            TemplateKind::Branded => {
                let footer = self.footer(transactional, token);
                format!(
                    r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
        body {{ font-family: Arial, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; }}
        .header {{ background: linear-gradient(135deg, #0f172a 0%, #1e293b 100%); color: white; padding: 30px; text-align: center; }}
        .content {{ padding: 30px; }}
        .footer {{ text-align: center; color: #6b7280; font-size: 12px; padding: 20px; background: #f8fafc; border-top: 1px solid #e5e7eb; }}
        .footer a {{ color: #6b7280; }}
        p {{ margin: 0 0 16px 0; }}
        a {{ color: #f97316; }}
    </style>
</head>
<body>
    <div class="content">
        {content}
    </div>
    <div class="footer">
        {footer}
    </div>
</body>
</html>"#
                )
            }
        }
    }

    fn footer(&self, transactional: bool, token: &str) -> String {
        let mut footer = String::new();
        if !self.base_url.is_empty() {
            footer.push_str(&format!(
                r#"<p><a href="{0}">{0}</a></p>"#,
                self.base_url
            ));
        }
        if !transactional && !token.is_empty() {
            footer.push_str(&format!(
                r#"<p style="margin-top: 15px;"><a href="{}">Unsubscribe</a></p>"#,
                self.unsubscribe_url(token)
            ));
        }
        footer
    }
}
