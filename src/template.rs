//! # Mini template engine for key and path formatting.
//!
//! Config stanzas carry small templates: a `format` rewriting an emitted key
//! (`"APP_{{key}}"`), a secret `path` referencing the OS environment
//! (`"secret/{{env \"STAGE\"}}/db"`), or a per-field service format
//! (`"{{service}}_{{key}}"`). All three contexts share one engine; what
//! differs is the function table bound for the call.
//!
//! ## Grammar
//!
//! Literal text, interrupted by `{{ ... }}` calls. Inside a call the first
//! token is a function name; remaining tokens are arguments — either quoted
//! string literals or bare names resolved through the same table (so
//! `{{replaceKey key "a" "b"}}` works).
//!
//! ## Functions
//!
//! | name         | bound when              | result                          |
//! |--------------|-------------------------|---------------------------------|
//! | `key`        | key/service formatting  | the current key                 |
//! | `service`    | service formatting      | the current service name        |
//! | `env "VAR"`  | path rendering          | `$VAR`, error if unset          |
//! | `replaceKey a b c` | key formatting    | `b` if `a == c`, else `c`       |

use crate::error::TemplateError;

/// Function bindings for a single render call.
///
/// Unbound slots make the corresponding function an
/// [`UnknownFunction`](TemplateError::UnknownFunction) error, which keeps the
/// three template contexts disjoint without needing three engines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateVars<'a> {
    key: Option<&'a str>,
    service: Option<&'a str>,
    env_allowed: bool,
}

impl<'a> TemplateVars<'a> {
    /// Bindings for a key `format` template: `key` and `replaceKey`.
    pub fn for_key(key: &'a str) -> Self {
        Self {
            key: Some(key),
            service: None,
            env_allowed: false,
        }
    }

    /// Bindings for a service field format: `service` and `key`.
    pub fn for_service(service: &'a str, field: &'a str) -> Self {
        Self {
            key: Some(field),
            service: Some(service),
            env_allowed: false,
        }
    }

    /// Bindings for a dependency `path` template: `env` only.
    pub fn for_path() -> Self {
        Self {
            key: None,
            service: None,
            env_allowed: true,
        }
    }
}

/// Renders `template` with the given bindings.
pub fn render(template: &str, vars: &TemplateVars<'_>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after.find("}}").ok_or_else(|| TemplateError::Parse {
            template: template.to_string(),
            reason: "unterminated '{{'".to_string(),
        })?;
        let call = &after[..close];
        out.push_str(&eval(call, template, vars)?);
        rest = &after[close + 2..];
    }
    out.push_str(rest);

    Ok(out)
}

/// Evaluates one `{{ ... }}` call.
fn eval(call: &str, template: &str, vars: &TemplateVars<'_>) -> Result<String, TemplateError> {
    let tokens = tokenize(call, template)?;
    let (name, args) = match tokens.split_first() {
        Some((Token::Name(name), args)) => (name.as_str(), args),
        _ => {
            return Err(TemplateError::Parse {
                template: template.to_string(),
                reason: "expected a function name".to_string(),
            })
        }
    };

    // Arguments are literals or zero-argument function references.
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Token::Literal(s) => values.push(s.clone()),
            Token::Name(n) => values.push(call_fn(n, &[], template, vars)?),
        }
    }

    call_fn(name, &values, template, vars)
}

fn call_fn(
    name: &str,
    args: &[String],
    template: &str,
    vars: &TemplateVars<'_>,
) -> Result<String, TemplateError> {
    let arity = |expected: usize| -> Result<(), TemplateError> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(TemplateError::BadArity {
                name: name.to_string(),
                expected,
                template: template.to_string(),
            })
        }
    };

    match name {
        "key" => {
            arity(0)?;
            vars.key.map(str::to_string).ok_or_else(|| unknown(name, template))
        }
        "service" => {
            arity(0)?;
            vars.service
                .map(str::to_string)
                .ok_or_else(|| unknown(name, template))
        }
        "env" => {
            if !vars.env_allowed {
                return Err(unknown(name, template));
            }
            arity(1)?;
            let var = &args[0];
            std::env::var(var).map_err(|_| TemplateError::MissingEnv {
                var: var.clone(),
                template: template.to_string(),
            })
        }
        "replaceKey" => {
            if vars.key.is_none() {
                return Err(unknown(name, template));
            }
            arity(3)?;
            if args[0] == args[2] {
                Ok(args[1].clone())
            } else {
                Ok(args[2].clone())
            }
        }
        _ => Err(unknown(name, template)),
    }
}

fn unknown(name: &str, template: &str) -> TemplateError {
    TemplateError::UnknownFunction {
        name: name.to_string(),
        template: template.to_string(),
    }
}

#[derive(Debug, Clone)]
enum Token {
    /// Bare identifier: a function name or zero-arg function reference.
    Name(String),
    /// Quoted string literal.
    Literal(String),
}

fn tokenize(call: &str, template: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut chars = call.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut lit = String::new();
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(esc) => lit.push(esc),
                        None => {
                            return Err(TemplateError::Parse {
                                template: template.to_string(),
                                reason: "dangling escape in string literal".to_string(),
                            })
                        }
                    },
                    Some('"') => break,
                    Some(other) => lit.push(other),
                    None => {
                        return Err(TemplateError::Parse {
                            template: template.to_string(),
                            reason: "unterminated string literal".to_string(),
                        })
                    }
                }
            }
            tokens.push(Token::Literal(lit));
        } else if c.is_ascii_alphanumeric() || c == '_' {
            let mut name = String::new();
            while let Some(&n) = chars.peek() {
                if n.is_ascii_alphanumeric() || n == '_' {
                    name.push(n);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Name(name));
        } else {
            return Err(TemplateError::Parse {
                template: template.to_string(),
                reason: format!("unexpected character {c:?}"),
            });
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_passthrough() {
        let vars = TemplateVars::for_key("host");
        assert_eq!(render("no calls here", &vars).unwrap(), "no calls here");
    }

    #[test]
    fn key_binding() {
        let vars = TemplateVars::for_key("host");
        assert_eq!(render("APP_{{key}}", &vars).unwrap(), "APP_host");
        assert_eq!(render("{{ key }}_SUFFIX", &vars).unwrap(), "host_SUFFIX");
    }

    #[test]
    fn replace_key_matches() {
        let vars = TemplateVars::for_key("ignored");
        assert_eq!(
            render(r#"{{replaceKey "db" "DATABASE" "db"}}"#, &vars).unwrap(),
            "DATABASE"
        );
        assert_eq!(
            render(r#"{{replaceKey "db" "DATABASE" "other"}}"#, &vars).unwrap(),
            "other"
        );
    }

    #[test]
    fn replace_key_with_key_argument() {
        let vars = TemplateVars::for_key("db");
        assert_eq!(
            render(r#"{{replaceKey key "DATABASE" "db"}}"#, &vars).unwrap(),
            "DATABASE"
        );
    }

    #[test]
    fn service_binding() {
        let vars = TemplateVars::for_service("web", "port");
        assert_eq!(
            render("{{service}}/{{key}}", &vars).unwrap(),
            "web/port"
        );
    }

    #[test]
    fn env_requires_path_context() {
        let vars = TemplateVars::for_key("k");
        assert!(matches!(
            render(r#"{{env "HOME"}}"#, &vars),
            Err(TemplateError::UnknownFunction { .. })
        ));
    }

    #[test]
    fn env_resolves() {
        std::env::set_var("ENVISOR_TEST_STAGE", "prod");
        let vars = TemplateVars::for_path();
        assert_eq!(
            render(r#"secret/{{env "ENVISOR_TEST_STAGE"}}/db"#, &vars).unwrap(),
            "secret/prod/db"
        );
    }

    #[test]
    fn env_missing_fails() {
        let vars = TemplateVars::for_path();
        assert!(matches!(
            render(r#"{{env "ENVISOR_TEST_DOES_NOT_EXIST"}}"#, &vars),
            Err(TemplateError::MissingEnv { .. })
        ));
    }

    #[test]
    fn unterminated_call_is_parse_error() {
        let vars = TemplateVars::for_key("k");
        assert!(matches!(
            render("oops {{key", &vars),
            Err(TemplateError::Parse { .. })
        ));
    }

    #[test]
    fn bad_arity() {
        let vars = TemplateVars::for_key("k");
        assert!(matches!(
            render(r#"{{replaceKey "a" "b"}}"#, &vars),
            Err(TemplateError::BadArity { .. })
        ));
    }
}
