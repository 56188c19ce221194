//! Landing and client configuration pages
//!
//! Plain HTML rendered from the active identity. The landing page names the
//! protocol only; the identifier appears solely on the `/{uuid}` page, which
//! a client can only reach if it already knows it.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;

use crate::identity::Identity;
use crate::protocol::Framing;

/// Port assumed when the Host header carries none (TLS-terminating front)
const DEFAULT_PUBLIC_PORT: u16 = 443;

const STYLE: &str = "body{font-family:sans-serif;background:#0f172a;color:#fff;text-align:center;padding:40px;}\
.copy{background:#16a34a;padding:8px 16px;border-radius:8px;cursor:pointer;border:none;color:white;font-weight:bold;}\
.copy:active{transform:scale(0.97);}\
.info{color:#94a3b8;margin-top:12px;}\
code{word-break:break-all;}";

/// Public endpoint as seen by clients, taken from the Host header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicHost {
    pub host: String,
    pub port: u16,
}

impl PublicHost {
    /// Split a Host header value into host and port
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }

        // Bracketed IPv6, optionally with a port
        if let Some(rest) = value.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().ok()?,
                None if tail.is_empty() => DEFAULT_PUBLIC_PORT,
                None => return None,
            };
            return Some(Self {
                host: format!("[{}]", host),
                port,
            });
        }

        match value.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => Some(Self {
                host: host.to_string(),
                port: port.parse().ok()?,
            }),
            _ => Some(Self {
                host: value.to_string(),
                port: DEFAULT_PUBLIC_PORT,
            }),
        }
    }

    fn tls(&self) -> bool {
        self.port == DEFAULT_PUBLIC_PORT
    }
}

/// Client share link for the active identity
pub fn share_link(identity: &Identity, public: &PublicHost) -> String {
    match identity.framing() {
        Framing::Vless => vless_link(identity, public),
        Framing::Vmess => vmess_link(identity, public),
    }
}

fn vless_link(identity: &Identity, public: &PublicHost) -> String {
    let security = if public.tls() { "tls" } else { "none" };
    format!(
        "vless://{id}@{host}:{port}?encryption=none&security={security}&sni={host}&type=ws&host={host}&path=%2F#{host}",
        id = identity.id(),
        host = public.host,
        port = public.port,
        security = security,
    )
}

fn vmess_link(identity: &Identity, public: &PublicHost) -> String {
    let profile = json!({
        "v": "2",
        "ps": public.host,
        "add": public.host,
        "port": public.port.to_string(),
        "id": identity.id().to_string(),
        "aid": "0",
        "scy": "auto",
        "net": "ws",
        "type": "none",
        "host": public.host,
        "path": "/",
        "tls": if public.tls() { "tls" } else { "" },
        "sni": public.host,
    });
    format!("vmess://{}", STANDARD.encode(profile.to_string()))
}

/// Landing page: protocol only, never the identifier
pub fn landing(identity: &Identity) -> String {
    let protocol = identity.framing().name().to_uppercase();
    format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width,initial-scale=1">
<title>WebSocket Proxy</title>
<style>{style}</style>
</head>
<body>
<h1>WebSocket Proxy</h1>
<p>Protocol: <strong>{protocol}</strong></p>
<p class="info">Open <code>/&lt;uuid&gt;</code> for the client configuration.</p>
</body></html>"#,
        style = STYLE,
        protocol = protocol,
    )
}

/// Client configuration page with a copyable share link
pub fn config_page(identity: &Identity, public: &PublicHost) -> String {
    let link = escape_html(&share_link(identity, public));
    let protocol = identity.framing().name().to_uppercase();
    format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width,initial-scale=1">
<title>Client Configuration</title>
<style>{style}</style>
</head>
<body>
<h1>Client Configuration</h1>
<p>Protocol: <strong>{protocol}</strong></p>
<p>UUID: <code>{id}</code></p>
<p>Address: <code>{host}:{port}</code></p>
<p><code id="link">{link}</code></p>
<button class="copy" onclick="copyLink()">Copy Link</button>
<script>
function copyLink(){{
  const link=document.getElementById('link').innerText;
  navigator.clipboard.writeText(link);
  alert("Copied");
}}
</script>
</body></html>"#,
        style = STYLE,
        protocol = protocol,
        id = identity.id(),
        host = escape_html(&public.host),
        port = public.port,
        link = link,
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const ID: &str = "d342d11e-d424-4583-b36e-524ab1f0afa4";

    fn identity(framing: Framing) -> Identity {
        Identity::new(Uuid::parse_str(ID).unwrap(), framing)
    }

    #[test]
    fn test_public_host_parsing() {
        assert_eq!(
            PublicHost::parse("proxy.example.com"),
            Some(PublicHost { host: "proxy.example.com".into(), port: 443 })
        );
        assert_eq!(
            PublicHost::parse("127.0.0.1:8000"),
            Some(PublicHost { host: "127.0.0.1".into(), port: 8000 })
        );
        assert_eq!(
            PublicHost::parse("[::1]:8080"),
            Some(PublicHost { host: "[::1]".into(), port: 8080 })
        );
        assert_eq!(PublicHost::parse("host:notaport"), None);
        assert_eq!(PublicHost::parse(""), None);
    }

    #[test]
    fn test_vless_link() {
        let public = PublicHost::parse("proxy.example.com").unwrap();
        let link = share_link(&identity(Framing::Vless), &public);
        assert!(link.starts_with(&format!("vless://{}@proxy.example.com:443?", ID)));
        assert!(link.contains("security=tls"));
        assert!(link.contains("type=ws"));
    }

    #[test]
    fn test_vmess_link_decodes_to_profile() {
        let public = PublicHost::parse("127.0.0.1:8000").unwrap();
        let link = share_link(&identity(Framing::Vmess), &public);
        let encoded = link.strip_prefix("vmess://").unwrap();
        let profile: serde_json::Value =
            serde_json::from_slice(&STANDARD.decode(encoded).unwrap()).unwrap();
        assert_eq!(profile["id"], ID);
        assert_eq!(profile["port"], "8000");
        assert_eq!(profile["net"], "ws");
        assert_eq!(profile["tls"], "");
    }

    #[test]
    fn test_landing_hides_identifier() {
        let page = landing(&identity(Framing::Vmess));
        assert!(page.contains("VMESS"));
        assert!(!page.contains(ID));
    }

    #[test]
    fn test_config_page_escapes_host() {
        let public = PublicHost {
            host: "<script>".into(),
            port: 443,
        };
        let page = config_page(&identity(Framing::Vless), &public);
        assert!(page.contains(ID));
        assert!(!page.contains("<script>:443"));
        assert!(page.contains("&lt;script&gt;"));
    }
}
