//! Typed nginx configuration model
//!
//! Routes are built as a [`Directive`] tree and only turned into nginx syntax by
//! [`Directive::render`]. Arguments are quoted at the boundary, so a session id or
//! path can never splice extra directives into the generated file.

use std::fmt::Write as _;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::UpstreamScheme;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Invalid directive name: {0:?}")]
    InvalidName(String),

    #[error("Directive {name} has an unrepresentable argument: {arg:?}")]
    InvalidArgument { name: String, arg: String },

    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),
}

/// One nginx directive: either `name args;` or `name args { children }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Simple {
        name: String,
        args: Vec<String>,
    },
    Block {
        name: String,
        args: Vec<String>,
        children: Vec<Directive>,
    },
}

impl Directive {
    pub fn simple<I, S>(name: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Directive::Simple {
            name: name.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn block<I, S>(name: &str, args: I, children: Vec<Directive>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Directive::Block {
            name: name.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            children,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Directive::Simple { name, .. } | Directive::Block { name, .. } => name,
        }
    }

    /// Structural check run before anything is written to disk
    pub fn validate(&self) -> Result<(), ModelError> {
        let (name, args) = match self {
            Directive::Simple { name, args } | Directive::Block { name, args, .. } => {
                (name, args)
            }
        };

        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(ModelError::InvalidName(name.clone()));
        }

        if let Some(arg) = args.iter().find(|arg| arg.chars().any(char::is_control)) {
            return Err(ModelError::InvalidArgument {
                name: name.clone(),
                arg: arg.clone(),
            });
        }

        if let Directive::Block { children, .. } = self {
            for child in children {
                child.validate()?;
            }
        }
        Ok(())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let indent = "    ".repeat(depth);
        match self {
            Directive::Simple { name, args } => {
                let _ = writeln!(out, "{}{}{};", indent, name, render_args(args));
            }
            Directive::Block {
                name,
                args,
                children,
            } => {
                let _ = writeln!(out, "{}{}{} {{", indent, name, render_args(args));
                for child in children {
                    child.render_into(out, depth + 1);
                }
                let _ = writeln!(out, "{}}}", indent);
            }
        }
    }
}

fn render_args(args: &[String]) -> String {
    args.iter().fold(String::new(), |mut acc, arg| {
        acc.push(' ');
        acc.push_str(&quote_arg(arg));
        acc
    })
}

/// Quote an argument when nginx would otherwise split or terminate it.
/// `$variables` stay interpolated inside double quotes.
fn quote_arg(arg: &str) -> String {
    let needs_quotes = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '#' | '"' | '\'' | '\\'));

    if !needs_quotes {
        return arg.to_string();
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Session ids become file names and URL segments
pub fn validate_session_id(session_id: &str) -> Result<(), ModelError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 64
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(ModelError::InvalidSessionId(session_id.to_string()))
    }
}

/// How one session is reachable from outside
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exposure {
    /// Under a path prefix of the shared server, e.g. `/tunnel/<id>/`
    Path { path: String },
    /// On a dedicated public port
    Port {
        public_port: u16,
        server_name: String,
        tls: Option<(PathBuf, PathBuf)>,
    },
}

/// Everything needed to render one session's fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRoute {
    pub session_id: String,
    pub local_port: u16,
    pub upstream_scheme: UpstreamScheme,
    pub access_log: PathBuf,
    pub exposure: Exposure,
}

impl SessionRoute {
    /// The route string recorded on the session row
    pub fn route_label(&self) -> String {
        match &self.exposure {
            Exposure::Path { path } => path.clone(),
            Exposure::Port { public_port, .. } => format!(":{}", public_port),
        }
    }

    pub fn upstream(&self) -> String {
        format!(
            "{}://127.0.0.1:{}/",
            self.upstream_scheme.as_str(),
            self.local_port
        )
    }

    /// Proxy settings shared by both exposure modes: upgrade support for
    /// websockets, no buffering in either direction, long read timeout.
    fn location_body(&self) -> Vec<Directive> {
        let mut body = vec![
            Directive::simple("proxy_pass", [self.upstream()]),
            Directive::simple("proxy_http_version", ["1.1"]),
            Directive::simple("proxy_set_header", ["Upgrade", "$http_upgrade"]),
            Directive::simple("proxy_set_header", ["Connection", "upgrade"]),
            Directive::simple("proxy_set_header", ["Host", "$host"]),
            Directive::simple(
                "proxy_set_header",
                ["X-Forwarded-For", "$proxy_add_x_forwarded_for"],
            ),
            Directive::simple("proxy_set_header", ["X-Forwarded-Proto", "$scheme"]),
            Directive::simple("proxy_buffering", ["off"]),
            Directive::simple("proxy_request_buffering", ["off"]),
            Directive::simple("proxy_read_timeout", ["3600s"]),
        ];
        if self.upstream_scheme == UpstreamScheme::Https {
            body.push(Directive::simple("proxy_ssl_verify", ["off"]));
        }
        body.push(Directive::simple(
            "access_log",
            [self.access_log.to_string_lossy().into_owned()],
        ));
        body
    }

    pub fn to_directives(&self) -> Vec<Directive> {
        match &self.exposure {
            Exposure::Path { path } => {
                vec![Directive::block(
                    "location",
                    ["^~".to_string(), path.clone()],
                    self.location_body(),
                )]
            }
            Exposure::Port {
                public_port,
                server_name,
                tls,
            } => {
                let mut server = Vec::new();
                match tls {
                    Some((certificate, key)) => {
                        server.push(Directive::simple(
                            "listen",
                            [public_port.to_string(), "ssl".to_string()],
                        ));
                        server.push(Directive::simple(
                            "ssl_certificate",
                            [certificate.to_string_lossy().into_owned()],
                        ));
                        server.push(Directive::simple(
                            "ssl_certificate_key",
                            [key.to_string_lossy().into_owned()],
                        ));
                    }
                    None => {
                        server.push(Directive::simple("listen", [public_port.to_string()]));
                    }
                }
                server.push(Directive::simple("server_name", [server_name.clone()]));
                server.push(Directive::block("location", ["/"], self.location_body()));
                vec![Directive::block("server", Vec::<String>::new(), server)]
            }
        }
    }

    /// Render the fragment file for this session
    pub fn render(&self) -> Result<String, ModelError> {
        validate_session_id(&self.session_id)?;
        let directives = self.to_directives();
        for directive in &directives {
            directive.validate()?;
        }

        let mut out = format!(
            "# tunnelgate session {} -> 127.0.0.1:{}\n",
            self.session_id, self.local_port
        );
        for directive in &directives {
            out.push_str(&directive.render());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path_route() -> SessionRoute {
        SessionRoute {
            session_id: "abc-123".to_string(),
            local_port: 8100,
            upstream_scheme: UpstreamScheme::Https,
            access_log: PathBuf::from("/var/log/nginx/tunnelgate/session-abc-123.log"),
            exposure: Exposure::Path {
                path: "/tunnel/abc-123/".to_string(),
            },
        }
    }

    #[test]
    fn test_path_route_renders_location_block() {
        let rendered = path_route().render().unwrap();

        assert!(rendered.starts_with("# tunnelgate session abc-123 -> 127.0.0.1:8100\n"));
        assert!(rendered.contains("location ^~ /tunnel/abc-123/ {\n"));
        assert!(rendered.contains("    proxy_pass https://127.0.0.1:8100/;\n"));
        assert!(rendered.contains("    proxy_set_header Upgrade $http_upgrade;\n"));
        assert!(rendered.contains("    proxy_buffering off;\n"));
        assert!(rendered.contains("    proxy_request_buffering off;\n"));
        assert!(rendered.contains("    proxy_ssl_verify off;\n"));
        assert!(rendered.ends_with("}\n"));
    }

    #[test]
    fn test_port_route_renders_server_block() {
        let route = SessionRoute {
            exposure: Exposure::Port {
                public_port: 9100,
                server_name: "fw.example.com".to_string(),
                tls: Some((
                    PathBuf::from("/etc/ssl/fw.pem"),
                    PathBuf::from("/etc/ssl/fw.key"),
                )),
            },
            upstream_scheme: UpstreamScheme::Http,
            ..path_route()
        };

        let rendered = route.render().unwrap();
        assert!(rendered.contains("server {\n"));
        assert!(rendered.contains("    listen 9100 ssl;\n"));
        assert!(rendered.contains("    server_name fw.example.com;\n"));
        assert!(rendered.contains("    location / {\n"));
        assert!(rendered.contains("        proxy_pass http://127.0.0.1:8100/;\n"));
        assert!(!rendered.contains("proxy_ssl_verify"));
        assert_eq!(route.route_label(), ":9100");
    }

    #[test]
    fn test_arguments_are_quoted() {
        let directive = Directive::simple("add_header", ["X-Note", "a b; c"]);
        assert_eq!(directive.render(), "add_header X-Note \"a b; c\";\n");

        let directive = Directive::simple("return", ["200", "say \"hi\""]);
        assert_eq!(directive.render(), "return 200 \"say \\\"hi\\\"\";\n");
    }

    #[test]
    fn test_control_characters_are_rejected() {
        let directive = Directive::simple("server_name", ["evil\n}"]);
        assert!(matches!(
            directive.validate(),
            Err(ModelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_invalid_session_id_is_rejected() {
        let route = SessionRoute {
            session_id: "../etc".to_string(),
            ..path_route()
        };
        assert!(matches!(
            route.render(),
            Err(ModelError::InvalidSessionId(_))
        ));
    }
}
