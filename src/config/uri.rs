/// Connection string parsing
///
/// Accepts `scheme://[user:pass@]host1[:port1][,host2[:port2]...]/[database][?opts]`.
/// Option names are matched case-insensitively against a fixed table; values
/// are percent-decoded before interpretation.
use super::{Acknowledgment, ClientOptions, ConfigError, Credential, ParseMode};
use crate::core::{Endpoint, TagSet};
use lazy_static::lazy_static;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use tracing::{debug, warn};

lazy_static! {
    /// Recognized options keyed by lowercase name
    static ref KNOWN_OPTIONS: HashMap<String, &'static str> = {
        let names = [
            "connectTimeoutMS",
            "socketTimeoutMS",
            "serverSelectionTimeoutMS",
            "heartbeatFrequencyMS",
            "localThresholdMS",
            "minPoolSize",
            "maxPoolSize",
            "maxIdleTimeMS",
            "waitQueueTimeoutMS",
            "waitQueueMultiple",
            "w",
            "wtimeoutMS",
            "journal",
            "readPreference",
            "readPreferenceTags",
            "maxStalenessSeconds",
            "appName",
            "retryReads",
            "authSource",
        ];
        names.iter().map(|name| (name.to_ascii_lowercase(), *name)).collect()
    };
}

/// A parsed connection string, not yet applied to any options
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionString {
    scheme: String,
    hosts: Vec<Endpoint>,
    database: Option<String>,
    credential: Option<Credential>,
    /// (canonical name, decoded value) in the order given
    options: Vec<(&'static str, String)>,
}

impl ConnectionString {
    pub fn parse(uri: &str, mode: ParseMode) -> Result<Self, ConfigError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| ConfigError::InvalidUri(format!("'{uri}' has no scheme")))?;

        if scheme.eq_ignore_ascii_case("mongodb+srv") {
            return Err(ConfigError::Unsupported(
                "mongodb+srv connection strings require DNS SRV lookup".to_string(),
            ));
        }
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::InvalidUri(format!("invalid scheme '{scheme}'")));
        }

        let (before_query, query) = match rest.split_once('?') {
            Some((before, query)) => (before, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = match before_query.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (before_query, ""),
        };

        let (userinfo, host_list) = match authority.rsplit_once('@') {
            Some((userinfo, hosts)) => (Some(userinfo), hosts),
            None => (None, authority),
        };

        let credential = userinfo.map(parse_userinfo).transpose()?;
        let hosts = parse_host_list(host_list)?;
        if hosts.is_empty() {
            return Err(ConfigError::InvalidUri("at least one host is required".to_string()));
        }

        let database = match decode(path, "database")? {
            name if name.is_empty() => None,
            name => Some(name),
        };

        let mut options = Vec::new();
        for pair in query
            .unwrap_or("")
            .split(['&', ';'])
            .filter(|p| !p.is_empty())
        {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidUri(format!("option '{pair}' has no value")))?;

            match KNOWN_OPTIONS.get(key.to_ascii_lowercase().as_str()) {
                Some(name) => options.push((*name, decode(value, name)?)),
                None if mode == ParseMode::Lenient => {
                    warn!("Ignoring unknown connection string option {}", key);
                }
                None => return Err(ConfigError::UnknownOption(key.to_string())),
            }
        }

        debug!(
            "Parsed connection string with {} host(s) and {} option(s)",
            hosts.len(),
            options.len()
        );

        Ok(Self {
            scheme: scheme.to_string(),
            hosts,
            database,
            credential,
            options,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn hosts(&self) -> &[Endpoint] {
        &self.hosts
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Layer this connection string over `base` and validate the result
    pub fn apply(&self, base: ClientOptions) -> Result<ClientOptions, ConfigError> {
        let mut options = base;
        options.hosts = self.hosts.clone();
        if self.database.is_some() {
            options.default_database = self.database.clone();
        }
        if self.credential.is_some() {
            options.credential = self.credential.clone();
        }

        let mut uri_tags: Option<Vec<TagSet>> = None;
        let mut auth_source = None;

        for (name, value) in &self.options {
            let name = *name;
            match name {
                "connectTimeoutMS" => options.connect_timeout_ms = parse_number(name, value)?,
                "socketTimeoutMS" => options.socket_timeout_ms = Some(parse_number(name, value)?),
                "serverSelectionTimeoutMS" => {
                    options.server_selection_timeout_ms = parse_number(name, value)?
                }
                "heartbeatFrequencyMS" => options.heartbeat_frequency_ms = parse_number(name, value)?,
                "localThresholdMS" => options.local_threshold_ms = parse_number(name, value)?,
                "minPoolSize" => options.min_pool_size = parse_number(name, value)?,
                "maxPoolSize" => options.max_pool_size = parse_number(name, value)?,
                "maxIdleTimeMS" => options.max_idle_time_ms = Some(parse_number(name, value)?),
                "waitQueueTimeoutMS" => options.wait_queue_timeout_ms = parse_number(name, value)?,
                "waitQueueMultiple" => options.wait_queue_multiple = parse_number(name, value)?,
                "w" => options.write_concern.w = Some(Acknowledgment::parse(value)),
                "wtimeoutMS" => options.write_concern.w_timeout_ms = Some(parse_number(name, value)?),
                "journal" => options.write_concern.journal = Some(parse_bool(name, value)?),
                "readPreference" => options.read_preference.mode = value.parse()?,
                "readPreferenceTags" => uri_tags.get_or_insert_with(Vec::new).push(value.parse()?),
                "maxStalenessSeconds" => {
                    let seconds: i64 = parse_number(name, value)?;
                    options.read_preference.max_staleness_ms = match seconds {
                        -1 => None,
                        s if s > 0 => Some(
                            u64::try_from(s)
                                .ok()
                                .and_then(|s| s.checked_mul(1000))
                                .ok_or_else(|| ConfigError::invalid_option(name, "out of range"))?,
                        ),
                        _ => {
                            return Err(ConfigError::invalid_option(
                                name,
                                "must be -1 or a positive number of seconds",
                            ))
                        }
                    };
                }
                "appName" => options.app_name = Some(value.clone()),
                "retryReads" => options.retry_reads = parse_bool(name, value)?,
                "authSource" => auth_source = Some(value.clone()),
                _ => return Err(ConfigError::UnknownOption(name.to_string())),
            }
        }

        if let Some(tag_sets) = uri_tags {
            options.read_preference.tag_sets = tag_sets;
        }

        if let Some(source) = auth_source {
            match options.credential.as_mut() {
                Some(credential) => credential.source = Some(source),
                None => debug!("authSource given without credentials, ignoring"),
            }
        }

        options.validate()?;
        Ok(options)
    }
}

/// Parse a comma-separated `host[:port]` list
pub fn parse_host_list(list: &str) -> Result<Vec<Endpoint>, ConfigError> {
    list.split(',')
        .filter(|h| !h.trim().is_empty())
        .map(|h| decode(h, "host")?.parse())
        .collect()
}

fn parse_userinfo(userinfo: &str) -> Result<Credential, ConfigError> {
    let (user, password) = match userinfo.split_once(':') {
        Some((user, password)) => (user, Some(password)),
        None => (userinfo, None),
    };

    let username = decode(user, "username")?;
    if username.is_empty() {
        return Err(ConfigError::InvalidUri("username cannot be empty".to_string()));
    }

    Ok(Credential {
        username,
        password: password.map(|p| decode(p, "password")).transpose()?,
        source: None,
    })
}

fn decode(raw: &str, what: &str) -> Result<String, ConfigError> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| ConfigError::InvalidUri(format!("{what} is not valid UTF-8 once decoded")))
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid_option(name, format!("'{value}' is not a valid number")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError::invalid_option(name, format!("'{value}' is not true or false"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriteConcern;
    use crate::core::ReadPreferenceMode;
    use std::time::Duration;

    fn parse(uri: &str) -> Result<ClientOptions, ConfigError> {
        ConnectionString::parse(uri, ParseMode::Strict)?.apply(ClientOptions::default())
    }

    #[test]
    fn test_hosts_and_database() {
        let options = parse("proto://h1:27017,h2:27018/db?readPreference=secondaryPreferred").unwrap();
        assert_eq!(
            options.hosts,
            vec![Endpoint::new("h1", 27017), Endpoint::new("h2", 27018)]
        );
        assert_eq!(options.default_database.as_deref(), Some("db"));
        assert_eq!(options.read_preference.mode, ReadPreferenceMode::SecondaryPreferred);
    }

    #[test]
    fn test_defaults_without_path_or_port() {
        let uri = ConnectionString::parse("mongodb://localhost", ParseMode::Strict).unwrap();
        assert_eq!(uri.scheme(), "mongodb");
        assert_eq!(uri.hosts(), &[Endpoint::new("localhost", 27017)]);
        assert_eq!(uri.database(), None);
    }

    #[test]
    fn test_credentials_are_percent_decoded() {
        let options = parse("mongodb://ad%40a:p%3Ass@h1/admin?authSource=users").unwrap();
        let credential = options.credential.unwrap();
        assert_eq!(credential.username, "ad@a");
        assert_eq!(credential.password.as_deref(), Some("p:ss"));
        assert_eq!(credential.source.as_deref(), Some("users"));
    }

    #[test]
    fn test_option_names_are_case_insensitive() {
        let options = parse(
            "mongodb://h1/?CONNECTTIMEOUTMS=2500&maxpoolsize=7&MinPoolSize=2&heartbeatFrequencyMS=20000",
        )
        .unwrap();
        assert_eq!(options.connect_timeout(), Duration::from_millis(2500));
        assert_eq!(options.max_pool_size, 7);
        assert_eq!(options.min_pool_size, 2);
        assert_eq!(options.heartbeat_frequency(), Duration::from_secs(20));
    }

    #[test]
    fn test_write_concern_options() {
        let options = parse("mongodb://h1/?w=majority&wtimeoutMS=500&journal=true").unwrap();
        assert_eq!(
            options.write_concern,
            WriteConcern::majority()
                .w_timeout(Duration::from_millis(500))
                .journal(true)
        );

        let options = parse("mongodb://h1/?w=2").unwrap();
        assert_eq!(options.write_concern.w, Some(Acknowledgment::Nodes(2)));
    }

    #[test]
    fn test_repeated_tag_sets_keep_order() {
        let options = parse(
            "mongodb://h1,h2/?readPreference=secondary&readPreferenceTags=dc:ny,rack:1&readPreferenceTags=dc:sf&readPreferenceTags=",
        )
        .unwrap();
        let tag_sets = &options.read_preference.tag_sets;
        assert_eq!(tag_sets.len(), 3);
        assert_eq!(tag_sets[0], TagSet::from_pairs([("dc", "ny"), ("rack", "1")]));
        assert_eq!(tag_sets[1], TagSet::from_pairs([("dc", "sf")]));
        assert!(tag_sets[2].is_empty());
    }

    #[test]
    fn test_max_staleness() {
        let options = parse("mongodb://h1/?readPreference=nearest&maxStalenessSeconds=120").unwrap();
        assert_eq!(
            options.read_preference.max_staleness_duration(),
            Some(Duration::from_secs(120))
        );

        let options = parse("mongodb://h1/?readPreference=nearest&maxStalenessSeconds=-1").unwrap();
        assert_eq!(options.read_preference.max_staleness_ms, None);

        assert!(parse("mongodb://h1/?readPreference=nearest&maxStalenessSeconds=30").is_err());
        assert!(parse("mongodb://h1/?maxStalenessSeconds=120").is_err());
    }

    #[test]
    fn test_max_staleness_out_of_range() {
        let result = parse("mongodb://h1/?readPreference=secondary&maxStalenessSeconds=9223372036854775807");
        assert!(matches!(result, Err(ConfigError::InvalidOption { .. })));
    }

    #[test]
    fn test_unknown_option_strict_and_lenient() {
        assert_eq!(
            ConnectionString::parse("mongodb://h1/?frobnicate=1", ParseMode::Strict).unwrap_err(),
            ConfigError::UnknownOption("frobnicate".to_string())
        );

        let uri = ConnectionString::parse("mongodb://h1/?frobnicate=1&maxPoolSize=3", ParseMode::Lenient)
            .unwrap();
        assert_eq!(uri.apply(ClientOptions::default()).unwrap().max_pool_size, 3);
    }

    #[test]
    fn test_malformed_connection_strings() {
        assert!(matches!(parse("h1:27017"), Err(ConfigError::InvalidUri(_))));
        assert!(matches!(parse("mongodb+srv://cluster.example.net"), Err(ConfigError::Unsupported(_))));
        assert!(matches!(parse("mon go://h1"), Err(ConfigError::InvalidUri(_))));
        assert!(matches!(parse("mongodb:///db"), Err(ConfigError::InvalidUri(_))));
        assert!(matches!(parse("mongodb://h1:0"), Err(ConfigError::InvalidHost { .. })));
        assert!(matches!(parse("mongodb://h1/?maxPoolSize"), Err(ConfigError::InvalidUri(_))));
        assert!(matches!(parse("mongodb://h1/?maxPoolSize=lots"), Err(ConfigError::InvalidOption { .. })));
        assert!(matches!(parse("mongodb://h1/?journal=maybe"), Err(ConfigError::InvalidOption { .. })));
        assert!(matches!(parse("mongodb://h1/?readPreference=fastest"), Err(ConfigError::InvalidOption { .. })));
        assert!(matches!(parse("mongodb://:pw@h1"), Err(ConfigError::InvalidUri(_))));
    }

    #[test]
    fn test_pool_bounds_validated() {
        assert!(parse("mongodb://h1/?maxPoolSize=0").is_err());
        assert!(parse("mongodb://h1/?minPoolSize=10&maxPoolSize=5").is_err());
    }

    #[test]
    fn test_uri_layers_over_base_options() {
        let base = ClientOptions {
            max_pool_size: 42,
            app_name: Some("base".to_string()),
            ..Default::default()
        };
        let options = ConnectionString::parse("mongodb://h1/?appName=uri", ParseMode::Strict)
            .unwrap()
            .apply(base)
            .unwrap();
        assert_eq!(options.max_pool_size, 42);
        assert_eq!(options.app_name.as_deref(), Some("uri"));
    }

    #[test]
    fn test_host_list() {
        let hosts = parse_host_list("a:1, b ,[::1]:3").unwrap();
        assert_eq!(
            hosts,
            vec![Endpoint::new("a", 1), Endpoint::new("b", 27017), Endpoint::new("::1", 3)]
        );
        assert!(parse_host_list("a:x").is_err());
    }
}
