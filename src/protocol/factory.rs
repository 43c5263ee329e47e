//! Parser construction
//!
//! Maps an `(AnalyzerType, ProtocolKind)` pair to a concrete parser.
//! ASTM analyzers share one parser type parameterized by their dialect
//! table; the other protocols have dedicated parsers. Unknown pairings
//! fall back to the generic ASTM parser.

use crate::config::{AnalyzerType, ProtocolKind};
use crate::model::LinkObserver;
use crate::protocol::dialect::dialect_for;
use crate::protocol::{AstmParser, Hl7Parser, LisParser, Parser, Poct1aParser};
use crate::store::ResultStore;
use std::sync::Arc;
use tracing::debug;

/// Build the parser for one listener's analyzer/protocol pairing
pub fn make_parser(
    analyzer: AnalyzerType,
    protocol: ProtocolKind,
    store: Arc<dyn ResultStore>,
    observer: Arc<dyn LinkObserver>,
) -> Box<dyn Parser> {
    debug!(?analyzer, ?protocol, "Constructing parser");
    match protocol {
        ProtocolKind::Astm => {
            Box::new(AstmParser::new(dialect_for(analyzer), store, observer))
        }
        ProtocolKind::Hl7 => Box::new(Hl7Parser::new(store, observer)),
        ProtocolKind::Lis => Box::new(LisParser::new(store, observer)),
        ProtocolKind::Poct1a => Box::new(Poct1aParser::new(store, observer)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NullObserver;
    use crate::protocol::{ACK, ENQ};
    use crate::store::SqliteStore;

    fn build(analyzer: AnalyzerType, protocol: ProtocolKind) -> Box<dyn Parser> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        make_parser(analyzer, protocol, store, Arc::new(NullObserver))
    }

    #[test]
    fn test_every_pairing_constructs() {
        let analyzers = [
            AnalyzerType::Generic,
            AnalyzerType::SysmexXn,
            AnalyzerType::CobasC311,
            AnalyzerType::DimensionExl,
            AnalyzerType::Vitros,
            AnalyzerType::BeckmanAu,
            AnalyzerType::Response910,
        ];
        let protocols = [
            ProtocolKind::Astm,
            ProtocolKind::Hl7,
            ProtocolKind::Lis,
            ProtocolKind::Poct1a,
        ];
        for analyzer in analyzers {
            for protocol in protocols {
                let _ = build(analyzer, protocol);
            }
        }
    }

    #[test]
    fn test_astm_parser_answers_enq() {
        let mut parser = build(AnalyzerType::SysmexXn, ProtocolKind::Astm);
        assert_eq!(parser.handle_data(&[ENQ]), Some(vec![ACK]));
    }

    #[test]
    fn test_hl7_parser_ignores_enq() {
        let mut parser = build(AnalyzerType::Generic, ProtocolKind::Hl7);
        assert_eq!(parser.handle_data(&[ENQ]), None);
    }
}
