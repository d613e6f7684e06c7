#[cfg(test)]
mod tests {
    use super::super::equilibrium::Clearing;
    use super::super::events::*;
    use super::super::market::MarketBasis;
    use super::super::price::{Price, PriceUpdate};
    use super::super::types::{AgentId, BidNumber, ClusterId, SessionId};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn price_update(bid_number: u64) -> PriceUpdate {
        let basis = MarketBasis::new("electricity", "EUR", 11, dec!(0), dec!(10)).unwrap();
        PriceUpdate::new(Price::new(basis, dec!(2.5)).unwrap(), BidNumber(bid_number))
    }

    #[test]
    fn test_event_creation_and_display() {
        let event = Event {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
            cluster_id: ClusterId::new("grid"),
            agent_id: AgentId::from("freezer"),
            session_id: None,
            event_type: EventType::IncomingPriceUpdate {
                price_update: price_update(3),
            },
        };

        let display = format!("{}", event);
        assert!(display.contains("[12:30:00.000] grid freezer:"));
        assert!(display.contains("received price 2.5 EUR for bid 3"));
    }

    #[test]
    fn test_event_log() {
        let log = EventLog::new();
        let cluster = ClusterId::new("grid");
        let freezer = AgentId::from("freezer");
        let session = SessionId::new(&freezer, &AgentId::from("root"), 1);

        log.log(
            Utc::now(),
            &cluster,
            &freezer,
            Some(&session),
            EventType::SessionConnected {
                parent_id: AgentId::from("root"),
            },
        );
        log.log(
            Utc::now(),
            &cluster,
            &AgentId::from("root"),
            None,
            EventType::EquilibriumComputed {
                price_update: price_update(1),
                clearing: Clearing::Cleared,
            },
        );
        log.log(
            Utc::now(),
            &cluster,
            &freezer,
            Some(&session),
            EventType::IncomingPriceUpdate {
                price_update: price_update(1),
            },
        );

        assert_eq!(log.len(), 3);
        assert_eq!(log.events_for(&freezer).len(), 2);
        assert_eq!(log.incoming_price_updates(&freezer), vec![price_update(1)]);

        // clones share the same queue
        let observer = log.clone();
        assert_eq!(observer.drain().len(), 3);
        assert!(log.is_empty());
    }

    #[test]
    fn test_event_serialization() {
        let event = Event {
            timestamp: Utc::now(),
            cluster_id: ClusterId::new("grid"),
            agent_id: AgentId::from("root"),
            session_id: None,
            event_type: EventType::PriceRejected {
                price_update: price_update(2),
                reason: "stale".to_string(),
            },
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"PriceRejected\""));
        let deserialized: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(event.agent_id, deserialized.agent_id);
        assert_eq!(deserialized.event_type.name(), "PriceRejected");
    }

    #[test]
    fn test_event_log_persistence() {
        let log = EventLog::new();
        log.log(
            Utc::now(),
            &ClusterId::new("grid"),
            &AgentId::from("freezer"),
            None,
            EventType::IncomingPriceUpdate {
                price_update: price_update(4),
            },
        );

        let temp_file = std::env::temp_dir().join("gridmatch_test_events.json");
        let temp_file = temp_file.to_str().unwrap();
        log.save_to_file(temp_file).unwrap();

        let loaded = EventLog::load_from_file(temp_file).unwrap();
        assert_eq!(
            loaded.incoming_price_updates(&AgentId::from("freezer")),
            vec![price_update(4)]
        );

        std::fs::remove_file(temp_file).ok();
    }
}
