use crate::config::MailConfig;

const SUBJECT: &str = "A Morning Note for my {name}";

const PLAIN: &str = "Good morning, {name} ❤️\n\n";

// Inline CSS only, mail clients drop <link> and most <style> selectors.
const HTML: &str = r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width,initial-scale=1" />
    <style>
      body { background:#f7f6fb; font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, 'Helvetica Neue', Arial; margin:0; padding:0; }
      .card { max-width:600px; margin:28px auto; background:#fff; border-radius:12px; box-shadow:0 6px 20px rgba(32,33,36,0.08); overflow:hidden; }
      .hero { background:linear-gradient(135deg,#ff9a9e 0%,#fecfef 100%); padding:28px; text-align:center; color:#3b2a2a; }
      h1 { margin:0; font-size:22px; }
      .content { padding:24px; color:#333; line-height:1.5; }
      .heart { color:#e74c3c; font-size:20px; margin:0 6px; }
      .footer { padding:16px 24px; font-size:12px; color:#888; text-align:center; background:#fafafa; }
      @media (max-width:420px) { .content { padding:16px; } .hero { padding:20px; } }
    </style>
  </head>
  <body>
    <div class="card">
      <div class="hero">
        <h1>Good morning, {name} <span class="heart">❤️</span></h1>
      </div>
      <div class="content">
        <p>My dearest {name},</p>
        <p>Every morning I wake grateful for you. You are radiant, kind, and endlessly beautiful, inside and out.</p>
        <p><strong>I love you.</strong> Have a wonderful day filled with whimsy and joy.</p>
        <p>All my love,<br/>Yours forever</p>
      </div>
      <div class="footer">Sent with love &bull; Whimsy</div>
    </div>
  </body>
</html>"#;

/// Wholesale replacements for the built-in templates.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub subject: Option<String>,
    pub plain: Option<String>,
    pub html: Option<String>,
}

impl From<&MailConfig> for Overrides {
    fn from(cfg: &MailConfig) -> Self {
        Self {
            subject: cfg.email_subject.clone(),
            plain: cfg.email_plain.clone(),
            html: cfg.email_html.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub subject: String,
    pub plain: String,
    pub html: String,
}

impl Greeting {
    /// Renders each part from its override if given, else from the template.
    ///
    /// The name is inserted into the HTML as-is, without escaping.
    pub fn compose(to_name: &str, overrides: &Overrides) -> Self {
        let part = |over: &Option<String>, template: &str| match over {
            Some(text) => text.clone(),
            None => render_text(template, to_name),
        };

        Self {
            subject: part(&overrides.subject, SUBJECT),
            plain: part(&overrides.plain, PLAIN),
            html: part(&overrides.html, HTML),
        }
    }
}

/// Replace all `{name}` placeholders with the recipient name.
pub fn render_text(text: &str, name: &str) -> String {
    text.replace("{name}", name)
}
