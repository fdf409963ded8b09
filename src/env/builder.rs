//! # Environment builder: (snapshot, config) → emitted variables.
//!
//! The build is a pure function of the data snapshot, the originating specs,
//! and the global sanitize/upcase flags. Dependencies are walked in
//! registration order — never map order — so precedence is deterministic:
//! KV sources are registered before secret sources, which lets secrets
//! overwrite KV collisions and never the reverse.
//!
//! ## Rules
//! - If any registered dependency has no snapshot entry yet, the build
//!   reports not-ready and nothing else happens this tick.
//! - Within a tick, a later assignment to the same key wins.
//! - `no_prefix` is three-valued and its default differs by source: a KV
//!   path is prepended only when `no_prefix` is explicitly `false`; a secret
//!   path is prepended unless `no_prefix` is explicitly `true`.
//! - Secret paths may reference the OS environment (`{{env "VAR"}}`) and are
//!   re-rendered when emitting; KV paths are used verbatim.
//! - Secret values that are not strings are skipped with a warning; empty
//!   keys and null values are skipped silently.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::{Config, KeyFormat, PrefixSpec, ServiceSpec};
use crate::core::Snapshot;
use crate::deps::{CatalogService, Dependency, DependencyData, KvPair, Secret};
use crate::error::BuildError;
use crate::template::{render, TemplateVars};

/// Result of one build attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// A registered dependency has no data yet; no child action this tick.
    NotReady { missing: String },
    /// The emitted environment for this snapshot.
    Ready(HashMap<String, String>),
}

/// Deterministic environment derivation over a data snapshot.
pub struct EnvironmentBuilder<'a> {
    sanitize: bool,
    upcase: bool,
    prefixes: &'a HashMap<String, PrefixSpec>,
    services: &'a HashMap<String, ServiceSpec>,
}

impl<'a> EnvironmentBuilder<'a> {
    pub fn new(
        config: &Config,
        prefixes: &'a HashMap<String, PrefixSpec>,
        services: &'a HashMap<String, ServiceSpec>,
    ) -> Self {
        Self {
            sanitize: config.sanitize(),
            upcase: config.upcase(),
            prefixes,
            services,
        }
    }

    /// Runs the build over `dependencies` in registration order.
    pub fn build(
        &self,
        dependencies: &[Dependency],
        snapshot: &Snapshot,
    ) -> Result<BuildOutcome, BuildError> {
        let mut env = HashMap::new();

        for dep in dependencies {
            let data = match snapshot.get(dep.identity()) {
                Some(data) => data,
                None => {
                    return Ok(BuildOutcome::NotReady {
                        missing: dep.identity().to_string(),
                    })
                }
            };

            match (dep, data) {
                (Dependency::KvList(q), DependencyData::KvPairs(pairs)) => {
                    self.emit_kv(&mut env, q.identity(), pairs)?;
                }
                (Dependency::VaultRead(q), DependencyData::Secret(secret)) => {
                    self.emit_secret(&mut env, q.identity(), secret)?;
                }
                (Dependency::CatalogService(q), DependencyData::Services(services)) => {
                    self.emit_services(&mut env, q.identity(), services)?;
                }
                (dep, data) => {
                    return Err(BuildError::Decode {
                        identity: dep.identity().to_string(),
                        expected: match dep {
                            Dependency::KvList(_) => "kv pairs",
                            Dependency::VaultRead(_) => "secret",
                            Dependency::CatalogService(_) => "services",
                        },
                        got: data.shape(),
                    })
                }
            }
        }

        Ok(BuildOutcome::Ready(env))
    }

    fn emit_kv(
        &self,
        env: &mut HashMap<String, String>,
        identity: &str,
        pairs: &[KvPair],
    ) -> Result<(), BuildError> {
        let spec = self.prefix_spec(identity)?;

        for pair in pairs {
            // A blank variable name is impossible; a blank value is fine.
            if pair.key.trim().is_empty() {
                continue;
            }
            let mut key = pair.key.clone();

            // KV default is to omit the prefix; only an explicit false turns
            // prefixing on.
            if spec.no_prefix == Some(false) {
                let path = invalid_to_underscore(spec.path.as_deref().unwrap_or_default());
                key = format!("{path}_{key}");
            }

            if let Some(format) = &spec.format {
                key = render(format, &TemplateVars::for_key(&key))?;
            }

            key = self.normalize(key);

            if let Some(old) = env.insert(key.clone(), pair.value.clone()) {
                debug!(target: "env", %key, %old, from = identity, "overwriting");
            } else {
                debug!(target: "env", %key, from = identity, "setting");
            }
        }

        Ok(())
    }

    fn emit_secret(
        &self,
        env: &mut HashMap<String, String>,
        identity: &str,
        secret: &Secret,
    ) -> Result<(), BuildError> {
        let spec = self.prefix_spec(identity)?;

        let payload = match secret.payload() {
            Some(payload) => payload,
            None => {
                debug!(target: "env", from = identity, "secret deleted or empty");
                return Ok(());
            }
        };

        // Per-key selection applies only when a keys list exists and no
        // global format overrides it.
        let key_formats: Option<HashMap<&str, Vec<&KeyFormat>>> =
            match (&spec.keys, &spec.format) {
                (Some(keys), None) => {
                    let mut map: HashMap<&str, Vec<&KeyFormat>> = HashMap::new();
                    for kf in keys {
                        if let Some(name) = kf.name.as_deref() {
                            map.entry(name).or_default().push(kf);
                        }
                    }
                    Some(map)
                }
                _ => None,
            };

        for (original_key, value) in payload {
            if original_key.trim().is_empty() {
                continue;
            }
            if value.is_null() {
                continue;
            }

            let mut keys = vec![original_key.clone()];
            if let Some(formats) = &key_formats {
                let listed = match formats.get(original_key.as_str()) {
                    Some(listed) => listed,
                    None => {
                        debug!(
                            target: "env",
                            key = %original_key,
                            "skipping key not listed in configuration"
                        );
                        continue;
                    }
                };
                let applied: Vec<String> = listed
                    .iter()
                    .filter_map(|kf| kf.format.as_deref())
                    .map(|f| render(f, &TemplateVars::for_key(original_key)))
                    .collect::<Result<_, _>>()?;
                if !applied.is_empty() {
                    keys = applied;
                }
            }

            for key in keys {
                let mut key = key;

                // Secret default is to include the prefix; only an explicit
                // true turns it off.
                if spec.no_prefix != Some(true) {
                    let path = render(
                        spec.path.as_deref().unwrap_or_default(),
                        &TemplateVars::for_path(),
                    )?;
                    let path = invalid_to_underscore(&path);
                    key = format!("{path}_{key}");
                }

                if let Some(format) = &spec.format {
                    key = render(format, &TemplateVars::for_key(&key))?;
                }

                key = self.normalize(key);

                let value = match value.as_str() {
                    Some(v) => v.to_string(),
                    None => {
                        warn!(
                            target: "env",
                            %key,
                            "skipping key, value is not a string"
                        );
                        continue;
                    }
                };

                if env.contains_key(&key) {
                    debug!(target: "env", %key, from = identity, "overwriting");
                }
                env.insert(key, value);
            }
        }

        Ok(())
    }

    fn emit_services(
        &self,
        env: &mut HashMap<String, String>,
        identity: &str,
        services: &[CatalogService],
    ) -> Result<(), BuildError> {
        let spec = self.services.get(identity);

        for service in services {
            let name = &service.service_name;
            let fields: [(&str, &Option<String>, String); 5] = [
                (
                    "id",
                    spec.map_or(&None, |s| &s.format_id),
                    service.service_id.clone(),
                ),
                (
                    "name",
                    spec.map_or(&None, |s| &s.format_name),
                    service.service_name.clone(),
                ),
                (
                    "address",
                    spec.map_or(&None, |s| &s.format_address),
                    service.service_address.clone(),
                ),
                (
                    "tag",
                    spec.map_or(&None, |s| &s.format_tag),
                    service.service_tags.join(","),
                ),
                (
                    "port",
                    spec.map_or(&None, |s| &s.format_port),
                    service.service_port.to_string(),
                ),
            ];

            for (field, format, value) in fields {
                let key = match format {
                    Some(format) => render(format, &TemplateVars::for_service(name, field))?,
                    None => format!("{name}/{field}"),
                };
                let key = self.normalize(key);
                debug!(target: "env", %key, from = identity, "setting");
                env.insert(key, value);
            }
        }

        Ok(())
    }

    fn prefix_spec(&self, identity: &str) -> Result<&PrefixSpec, BuildError> {
        self.prefixes
            .get(identity)
            .ok_or_else(|| BuildError::MissingSpec {
                identity: identity.to_string(),
            })
    }

    fn normalize(&self, mut key: String) -> String {
        if self.sanitize {
            key = invalid_to_underscore(&key);
        }
        if self.upcase {
            key = key.to_uppercase();
        }
        key
    }
}

/// Replaces every character outside `[A-Za-z0-9_]` with `_`.
pub fn invalid_to_underscore(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::{KvListQuery, ServiceCatalogQuery, VaultReadQuery};
    use serde_json::json;

    struct Fixture {
        config: Config,
        prefixes: HashMap<String, PrefixSpec>,
        services: HashMap<String, ServiceSpec>,
        dependencies: Vec<Dependency>,
        snapshot: Snapshot,
    }

    impl Fixture {
        fn new(config_json: &str) -> Self {
            let mut config = crate::config::parse(config_json).unwrap();
            config.finalize();
            Self {
                config,
                prefixes: HashMap::new(),
                services: HashMap::new(),
                dependencies: Vec::new(),
                snapshot: Snapshot::default(),
            }
        }

        fn kv(&mut self, spec: PrefixSpec, pairs: &[(&str, &str)]) {
            let query = KvListQuery::new(spec.path.as_deref().unwrap()).unwrap();
            self.prefixes.insert(query.identity().to_string(), spec);
            self.snapshot.insert(
                query.identity().to_string(),
                DependencyData::KvPairs(
                    pairs.iter().map(|(k, v)| KvPair::new(*k, *v)).collect(),
                ),
            );
            self.dependencies.push(Dependency::KvList(query));
        }

        fn secret(&mut self, spec: PrefixSpec, value: serde_json::Value) {
            let query = VaultReadQuery::new(spec.path.as_deref().unwrap()).unwrap();
            self.prefixes.insert(query.identity().to_string(), spec);
            self.snapshot.insert(
                query.identity().to_string(),
                DependencyData::Secret(Secret::from_value(value)),
            );
            self.dependencies.push(Dependency::VaultRead(query));
        }

        fn service(&mut self, spec: ServiceSpec, entries: Vec<CatalogService>) {
            let query = ServiceCatalogQuery::new(spec.query.as_deref().unwrap()).unwrap();
            self.services.insert(query.identity().to_string(), spec);
            self.snapshot.insert(
                query.identity().to_string(),
                DependencyData::Services(entries),
            );
            self.dependencies.push(Dependency::CatalogService(query));
        }

        fn build(&self) -> HashMap<String, String> {
            match self.outcome() {
                BuildOutcome::Ready(env) => env,
                other => panic!("expected ready, got {other:?}"),
            }
        }

        fn outcome(&self) -> BuildOutcome {
            EnvironmentBuilder::new(&self.config, &self.prefixes, &self.services)
                .build(&self.dependencies, &self.snapshot)
                .unwrap()
        }
    }

    #[test]
    fn prefix_upcase_sanitize() {
        let mut fx = Fixture::new(r#"{ "upcase": true, "sanitize": true }"#);
        let spec = PrefixSpec {
            path: Some("app/db".into()),
            no_prefix: Some(false),
            ..PrefixSpec::default()
        };
        fx.kv(spec, &[("host", "db1"), ("user.name", "x")]);

        let env = fx.build();
        assert_eq!(env.get("APP_DB_HOST").map(String::as_str), Some("db1"));
        assert_eq!(env.get("APP_DB_USER_NAME").map(String::as_str), Some("x"));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn kv_unset_no_prefix_omits_path() {
        let mut fx = Fixture::new("{}");
        fx.kv(PrefixSpec::from_path("app/db"), &[("host", "db1")]);
        let env = fx.build();
        assert_eq!(env.get("host").map(String::as_str), Some("db1"));
    }

    #[test]
    fn kv_explicit_no_prefix_true_omits_path() {
        let mut fx = Fixture::new("{}");
        let spec = PrefixSpec {
            path: Some("app/db".into()),
            no_prefix: Some(true),
            ..PrefixSpec::default()
        };
        fx.kv(spec, &[("host", "db1")]);
        assert!(fx.build().contains_key("host"));
    }

    #[test]
    fn kv_prefixed_key_shape() {
        // path foo/bar/baz, sanitize=false, upcase=false, no_prefix=false
        let mut fx = Fixture::new("{}");
        let spec = PrefixSpec {
            path: Some("foo/bar/baz".into()),
            no_prefix: Some(false),
            ..PrefixSpec::default()
        };
        fx.kv(spec, &[("k", "v")]);
        assert!(fx.build().contains_key("foo_bar_baz_k"));
    }

    #[test]
    fn kv_blank_keys_skipped() {
        let mut fx = Fixture::new("{}");
        fx.kv(PrefixSpec::from_path("app"), &[("  ", "x"), ("ok", "")]);
        let env = fx.build();
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("ok").map(String::as_str), Some(""));
    }

    #[test]
    fn secret_overrides_kv() {
        // Both sides emit the same key; the secret is registered later and
        // must win regardless of data-arrival order.
        let mut fx = Fixture::new(r#"{ "upcase": true }"#);
        fx.kv(PrefixSpec::from_path("app"), &[("token", "wrong")]);

        let secret_spec = PrefixSpec {
            path: Some("secret/app".into()),
            no_prefix: Some(true),
            ..PrefixSpec::default()
        };
        fx.secret(secret_spec, json!({ "token": "right" }));

        let env = fx.build();
        assert_eq!(env.get("TOKEN").map(String::as_str), Some("right"));
    }

    #[test]
    fn secret_default_includes_prefix() {
        let mut fx = Fixture::new("{}");
        fx.secret(
            PrefixSpec::from_path("secret/app"),
            json!({ "token": "v" }),
        );
        assert!(fx.build().contains_key("secret_app_token"));
    }

    #[test]
    fn kv2_payload_unwraps() {
        let mut fx = Fixture::new("{}");
        let spec = PrefixSpec {
            path: Some("secret/data/app".into()),
            no_prefix: Some(true),
            ..PrefixSpec::default()
        };
        fx.secret(
            spec,
            json!({
                "data": { "k": "v" },
                "metadata": { "version": 1 }
            }),
        );
        let env = fx.build();
        assert_eq!(env.get("k").map(String::as_str), Some("v"));
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn kv2_deleted_secret_emits_nothing() {
        let mut fx = Fixture::new("{}");
        let spec = PrefixSpec {
            path: Some("secret/data/app".into()),
            no_prefix: Some(true),
            ..PrefixSpec::default()
        };
        fx.secret(
            spec,
            json!({ "data": null, "metadata": { "version": 3 } }),
        );
        assert!(fx.build().is_empty());
    }

    #[test]
    fn secret_non_string_values_skipped() {
        let mut fx = Fixture::new("{}");
        let spec = PrefixSpec {
            path: Some("secret/app".into()),
            no_prefix: Some(true),
            ..PrefixSpec::default()
        };
        fx.secret(spec, json!({ "port": 5432, "user": "app", "extra": null }));
        let env = fx.build();
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("user").map(String::as_str), Some("app"));
    }

    #[test]
    fn secret_keys_list_restricts_emission() {
        let mut fx = Fixture::new("{}");
        let spec = PrefixSpec {
            path: Some("secret/app".into()),
            no_prefix: Some(true),
            keys: Some(vec![
                KeyFormat {
                    name: Some("user".into()),
                    format: Some("DB_{{key}}".into()),
                },
                KeyFormat {
                    name: Some("host".into()),
                    format: None,
                },
            ]),
            ..PrefixSpec::default()
        };
        fx.secret(spec, json!({ "user": "app", "host": "db1", "pass": "s3" }));

        let env = fx.build();
        assert_eq!(env.get("DB_user").map(String::as_str), Some("app"));
        assert_eq!(env.get("host").map(String::as_str), Some("db1"));
        assert!(!env.values().any(|v| v == "s3"));
    }

    #[test]
    fn secret_empty_keys_list_emits_nothing() {
        let mut fx = Fixture::new("{}");
        let spec = PrefixSpec {
            path: Some("secret/app".into()),
            no_prefix: Some(true),
            keys: Some(Vec::new()),
            ..PrefixSpec::default()
        };
        fx.secret(spec, json!({ "user": "app" }));
        assert!(fx.build().is_empty());
    }

    #[test]
    fn secret_global_format_disables_keys_list() {
        let mut fx = Fixture::new("{}");
        let spec = PrefixSpec {
            path: Some("secret/app".into()),
            no_prefix: Some(true),
            format: Some("G_{{key}}".into()),
            keys: Some(vec![KeyFormat {
                name: Some("user".into()),
                format: Some("IGNORED_{{key}}".into()),
            }]),
            ..PrefixSpec::default()
        };
        fx.secret(spec, json!({ "user": "app", "pass": "s3" }));

        let env = fx.build();
        assert_eq!(env.get("G_user").map(String::as_str), Some("app"));
        assert_eq!(env.get("G_pass").map(String::as_str), Some("s3"));
    }

    #[test]
    fn secret_path_template_resolves_env() {
        std::env::set_var("ENVISOR_TEST_BUILDER_STAGE", "prod");
        let mut fx = Fixture::new("{}");
        // Dependency registration would normally render the path too; the
        // spec map keeps the raw template, which re-renders at emission.
        let query = VaultReadQuery::new("secret/prod/db").unwrap();
        let spec = PrefixSpec {
            path: Some(r#"secret/{{env "ENVISOR_TEST_BUILDER_STAGE"}}/db"#.into()),
            ..PrefixSpec::default()
        };
        fx.prefixes.insert(query.identity().to_string(), spec);
        fx.snapshot.insert(
            query.identity().to_string(),
            DependencyData::Secret(Secret::from_value(json!({ "k": "v" }))),
        );
        fx.dependencies.push(Dependency::VaultRead(query));

        let env = fx.build();
        assert!(env.contains_key("secret_prod_db_k"));
    }

    #[test]
    fn services_emit_five_fields() {
        let mut fx = Fixture::new(r#"{ "upcase": true, "sanitize": true }"#);
        fx.service(
            ServiceSpec::from_query("web"),
            vec![CatalogService {
                service_id: "web-1".into(),
                service_name: "web".into(),
                service_address: "10.0.0.5".into(),
                service_tags: vec!["primary".into(), "v2".into()],
                service_port: 8080,
            }],
        );

        let env = fx.build();
        assert_eq!(env.get("WEB_ID").map(String::as_str), Some("web-1"));
        assert_eq!(env.get("WEB_NAME").map(String::as_str), Some("web"));
        assert_eq!(env.get("WEB_ADDRESS").map(String::as_str), Some("10.0.0.5"));
        assert_eq!(env.get("WEB_TAG").map(String::as_str), Some("primary,v2"));
        assert_eq!(env.get("WEB_PORT").map(String::as_str), Some("8080"));
    }

    #[test]
    fn service_field_formats_apply() {
        let mut fx = Fixture::new("{}");
        let spec = ServiceSpec {
            query: Some("web".into()),
            format_port: Some("{{service}}_listen_{{key}}".into()),
            ..ServiceSpec::default()
        };
        fx.service(
            spec,
            vec![CatalogService {
                service_id: "web-1".into(),
                service_name: "web".into(),
                service_port: 8080,
                ..CatalogService::default()
            }],
        );
        assert_eq!(
            fx.build().get("web_listen_port").map(String::as_str),
            Some("8080")
        );
    }

    #[test]
    fn missing_dependency_data_is_not_ready() {
        let mut fx = Fixture::new("{}");
        fx.kv(PrefixSpec::from_path("app"), &[("k", "v")]);

        let query = VaultReadQuery::new("secret/app").unwrap();
        fx.prefixes.insert(
            query.identity().to_string(),
            PrefixSpec::from_path("secret/app"),
        );
        fx.dependencies.push(Dependency::VaultRead(query));

        assert!(matches!(fx.outcome(), BuildOutcome::NotReady { .. }));
    }

    #[test]
    fn build_is_idempotent() {
        let mut fx = Fixture::new(r#"{ "upcase": true }"#);
        fx.kv(PrefixSpec::from_path("app"), &[("a", "1"), ("b", "2")]);
        assert_eq!(fx.build(), fx.build());
    }

    #[test]
    fn shape_mismatch_is_decode_error() {
        let mut fx = Fixture::new("{}");
        let query = KvListQuery::new("app").unwrap();
        fx.prefixes
            .insert(query.identity().to_string(), PrefixSpec::from_path("app"));
        fx.snapshot.insert(
            query.identity().to_string(),
            DependencyData::Secret(Secret::default()),
        );
        fx.dependencies.push(Dependency::KvList(query));

        let err = EnvironmentBuilder::new(&fx.config, &fx.prefixes, &fx.services)
            .build(&fx.dependencies, &fx.snapshot)
            .unwrap_err();
        assert!(matches!(err, BuildError::Decode { .. }));
    }
}
