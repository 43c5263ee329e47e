//! Listener and sync configuration consumed by the core
//!
//! The host application owns configuration loading; this crate only
//! defines the shapes it is instantiated with.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Analyzer model a listener is wired to
///
/// Selects the field-position tables and checksum behavior of the ASTM
/// family; unknown analyzers fall back to the generic dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalyzerType {
    Generic,
    SysmexXn,
    CobasC311,
    DimensionExl,
    Vitros,
    BeckmanAu,
    Response910,
}

impl AnalyzerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyzerType::Generic => "generic",
            AnalyzerType::SysmexXn => "sysmex-xn",
            AnalyzerType::CobasC311 => "cobas-c311",
            AnalyzerType::DimensionExl => "dimension-exl",
            AnalyzerType::Vitros => "vitros",
            AnalyzerType::BeckmanAu => "beckman-au",
            AnalyzerType::Response910 => "response-910",
        }
    }
}

impl std::str::FromStr for AnalyzerType {
    type Err = String;

    /// Accepts the loose spellings found in deployed configurations
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace([' ', '_'], "-");
        match key.as_str() {
            "generic" | "" => Ok(AnalyzerType::Generic),
            "sysmex" | "sysmex-xn" | "xn-550" => Ok(AnalyzerType::SysmexXn),
            "cobas" | "cobas-c311" | "c311" => Ok(AnalyzerType::CobasC311),
            "dimension" | "dimension-exl" | "exl-200" => Ok(AnalyzerType::DimensionExl),
            "vitros" | "vitros-350" => Ok(AnalyzerType::Vitros),
            "beckman" | "beckman-au" | "au480" => Ok(AnalyzerType::BeckmanAu),
            "response" | "response-910" | "dxc" => Ok(AnalyzerType::Response910),
            other => Err(format!("unknown analyzer type: {other}")),
        }
    }
}

/// Wire protocol spoken on a listener port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    /// ASTM E1394 and its vendor dialects
    Astm,
    /// HL7 v2 over MLLP
    Hl7,
    /// Proprietary pipe-delimited LIS dialect
    Lis,
    /// XML-framed POCT1-A variant
    Poct1a,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Astm => "astm",
            ProtocolKind::Hl7 => "hl7",
            ProtocolKind::Lis => "lis",
            ProtocolKind::Poct1a => "poct1a",
        }
    }
}

/// One inbound listener: a TCP port bound to an analyzer and protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub port: u16,
    pub analyzer: AnalyzerType,
    pub protocol: ProtocolKind,
    /// Display name used in logs and status events
    pub name: String,
}

impl ListenerConfig {
    pub fn new(port: u16, analyzer: AnalyzerType, protocol: ProtocolKind, name: &str) -> Self {
        ListenerConfig {
            port,
            analyzer,
            protocol,
            name: name.to_string(),
        }
    }
}

/// HTTP verb used for the sync upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMethod {
    Post,
    Put,
    Patch,
}

/// When the sync engine fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Poll every 5 seconds, sweeping all unsynced results
    Realtime,
    /// Fire once daily at the configured local hour:minute
    Scheduled { hour: u32, minute: u32 },
    /// Fire at instants computed from a 5-field cron expression
    Cron(String),
}

/// Authentication strategy applied to sync requests
///
/// Strategies are mutually exclusive; exactly one is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuthConfig {
    None,
    ApiKey {
        header: String,
        value: String,
    },
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    CustomHeader {
        name: String,
        value: String,
    },
    /// OAuth2 client-credentials grant; the token is cached until ~90% of
    /// its reported TTL has elapsed
    OAuth2 {
        token_url: String,
        client_id: String,
        client_secret: String,
        scope: Option<String>,
    },
}

/// Sync engine configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub endpoint_path: String,
    pub method: SyncMethod,
    pub mode: SyncMode,
    pub auth: AuthConfig,
    /// Identifies this installation in upload payloads
    pub instance_id: String,
    /// Analyzer label carried in upload payloads
    pub analyzer_type: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
    /// Upper bound on results swept per batch
    pub batch_limit: usize,
}

impl SyncConfig {
    /// Sensible defaults for a realtime deployment against `base_url`
    pub fn new(base_url: &str, instance_id: &str) -> Self {
        SyncConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            endpoint_path: "/api/results".to_string(),
            method: SyncMethod::Post,
            mode: SyncMode::Realtime,
            auth: AuthConfig::None,
            instance_id: instance_id.to_string(),
            analyzer_type: "generic".to_string(),
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            batch_limit: 500,
        }
    }

    /// Full upload URL
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, self.endpoint_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_analyzer_type_loose_spellings() {
        assert_eq!(AnalyzerType::from_str("Sysmex").unwrap(), AnalyzerType::SysmexXn);
        assert_eq!(AnalyzerType::from_str("cobas c311").unwrap(), AnalyzerType::CobasC311);
        assert_eq!(AnalyzerType::from_str("VITROS").unwrap(), AnalyzerType::Vitros);
        assert!(AnalyzerType::from_str("tricorder").is_err());
    }

    #[test]
    fn test_sync_endpoint_join() {
        let cfg = SyncConfig::new("https://lis.example.org/", "site-7");
        assert_eq!(cfg.endpoint(), "https://lis.example.org/api/results");
    }
}
