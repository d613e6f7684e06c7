//! Query and filter persisted cluster events.

use crate::cli::QueryFilters;
use crate::events::{Event, EventType};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Query events from an event file with filters
pub fn query_events(file: &Path, filters: &QueryFilters) -> Result<Vec<Event>, String> {
    let contents = fs::read_to_string(file).map_err(|e| format!("Failed to read file: {}", e))?;

    let events: Vec<Event> =
        serde_json::from_str(&contents).map_err(|e| format!("Failed to parse JSON: {}", e))?;

    Ok(filter_events(events, filters))
}

pub fn filter_events(events: Vec<Event>, filters: &QueryFilters) -> Vec<Event> {
    events
        .into_iter()
        .filter(|event| {
            if let Some(ref agent) = filters.agent {
                if event.agent_id.as_str() != agent {
                    return false;
                }
            }

            if let Some(ref event_type) = filters.event_type {
                if !event_matches_type(&event.event_type, event_type) {
                    return false;
                }
            }

            if let Some(ref session) = filters.session {
                match &event.session_id {
                    Some(id) if &id.0 == session => {}
                    _ => return false,
                }
            }

            true
        })
        .collect()
}

/// Matches an exact event name or a group keyword such as `price` or `stale`.
fn event_matches_type(event_type: &EventType, type_str: &str) -> bool {
    let type_lower = type_str.to_lowercase();
    if event_type.name().to_lowercase() == type_lower {
        return true;
    }

    match event_type {
        EventType::SessionConnected { .. } => type_lower.contains("connect"),
        EventType::SessionDisconnected { .. } => type_lower.contains("disconnect"),
        EventType::OutgoingBidUpdate { .. } | EventType::IncomingBidUpdate { .. } => {
            type_lower == "bid" || type_lower == "bids"
        }
        EventType::BidRejected { .. } => {
            type_lower.contains("reject") || type_lower == "bid" || type_lower == "bids"
        }
        EventType::OutgoingPriceUpdate { .. } | EventType::IncomingPriceUpdate { .. } => {
            type_lower == "price" || type_lower == "prices"
        }
        EventType::PriceRejected { .. } => {
            type_lower.contains("reject") || type_lower.contains("stale")
        }
        EventType::EquilibriumComputed { .. } => {
            type_lower.contains("equilibrium") || type_lower.contains("clear")
        }
    }
}

/// Summary of matching events, per type, with every event when `verbose`.
pub fn format_query_results(events: &[Event], verbose: bool) -> String {
    let mut output = String::new();

    output.push_str(&format!("Found {} events\n", events.len()));
    output.push_str(&"─".repeat(50));
    output.push('\n');

    if events.is_empty() {
        output.push_str("Nothing matched.\n");
        return output;
    }

    let mut type_counts = BTreeMap::new();
    for event in events {
        *type_counts.entry(event.event_type.name()).or_insert(0) += 1;
    }

    output.push_str("\nBy type:\n");
    for (event_type, count) in type_counts.iter() {
        output.push_str(&format!("  {}: {}\n", event_type, count));
    }

    if verbose {
        output.push_str("\nEvents:\n");
        for event in events {
            output.push_str(&format!("{}\n", event));
        }
    } else {
        output.push_str("\nRun with --verbose to list the events.\n");
    }

    output
}

/// One-line description used in the CSV `details` column.
fn format_event_details(event_type: &EventType) -> String {
    match event_type {
        EventType::SessionConnected { parent_id } => format!("connected to {}", parent_id),
        EventType::SessionDisconnected { parent_id } => {
            format!("disconnected from {}", parent_id)
        }
        EventType::OutgoingBidUpdate { bid_update } => {
            format!("bid {}", bid_update.bid_number)
        }
        EventType::IncomingBidUpdate {
            child_id,
            bid_update,
        } => format!("bid {} from {}", bid_update.bid_number, child_id),
        EventType::BidRejected {
            child_id, reason, ..
        } => format!("bid from {} rejected: {}", child_id, reason),
        EventType::OutgoingPriceUpdate {
            child_id,
            price_update,
        } => format!("{} to {}", price_update, child_id),
        EventType::IncomingPriceUpdate { price_update } => price_update.to_string(),
        EventType::PriceRejected {
            price_update,
            reason,
        } => format!("{} rejected: {}", price_update, reason),
        EventType::EquilibriumComputed {
            price_update,
            clearing,
        } => format!("{} {:?}", price_update, clearing),
    }
}

/// Writes matching events as CSV rows.
pub fn export_to_csv(events: &[Event], output: &Path) -> Result<(), String> {
    use std::io::Write;

    let mut file =
        fs::File::create(output).map_err(|e| format!("Failed to create CSV file: {}", e))?;

    writeln!(file, "timestamp,agent_id,session_id,event_type,details")
        .map_err(|e| format!("Failed to write CSV header: {}", e))?;

    for event in events {
        let session = event
            .session_id
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_default();
        writeln!(
            file,
            "{},{},{},{},\"{}\"",
            event.timestamp.to_rfc3339(),
            event.agent_id,
            session,
            event.event_type.name(),
            format_event_details(&event.event_type).replace('"', "'")
        )
        .map_err(|e| format!("Failed to write CSV row: {}", e))?;
    }

    Ok(())
}

/// Prices an agent received, in order.
pub fn price_history(events: &[Event], agent_id: &str) -> Vec<Decimal> {
    events
        .iter()
        .filter(|e| e.agent_id.as_str() == agent_id)
        .filter_map(|e| match &e.event_type {
            EventType::IncomingPriceUpdate { price_update } => Some(price_update.price.value()),
            EventType::EquilibriumComputed { price_update, .. } => {
                Some(price_update.price.value())
            }
            _ => None,
        })
        .collect()
}

/// ASCII chart of the prices an agent saw over the run.
pub fn price_timeline(events: &[Event], agent_id: &str, width: usize) -> String {
    let mut timeline = String::new();
    timeline.push_str(&format!("Price Timeline: {}\n", agent_id));
    timeline.push_str(&"─".repeat(width));
    timeline.push('\n');

    let history = price_history(events, agent_id);
    if history.is_empty() {
        timeline.push_str("No prices recorded for this agent.\n");
        return timeline;
    }

    let max_price = history.iter().copied().max().unwrap_or(Decimal::ONE);
    let min_price = history.iter().copied().min().unwrap_or(Decimal::ZERO);
    let span = if max_price > min_price {
        max_price - min_price
    } else {
        Decimal::ONE
    };

    let chart_height = 8;
    let chart_width = width.saturating_sub(10).max(1);

    for h in (0..chart_height).rev() {
        let threshold = min_price + span * Decimal::from(h) / Decimal::from(chart_height);
        timeline.push_str(&format!("{:>7.2} │", threshold));
        for x in 0..chart_width {
            let index = x * history.len() / chart_width;
            timeline.push(if history[index] > threshold { '█' } else { ' ' });
        }
        timeline.push('\n');
    }

    timeline.push_str("        └");
    timeline.push_str(&"─".repeat(chart_width));
    timeline.push('\n');
    timeline.push_str(&format!("         {} updates\n", history.len()));

    timeline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MarketBasis;
    use crate::price::{Price, PriceUpdate};
    use crate::types::{AgentId, BidNumber, ClusterId, SessionId};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn received(agent: &str, value: Decimal, sequence: u64) -> Event {
        let basis = MarketBasis::new("electricity", "EUR", 11, dec!(0), dec!(10)).unwrap();
        Event {
            timestamp: Utc::now(),
            cluster_id: ClusterId::new("test"),
            agent_id: AgentId::from(agent),
            session_id: Some(SessionId::new(
                &AgentId::from(agent),
                &AgentId::from("root"),
                sequence,
            )),
            event_type: EventType::IncomingPriceUpdate {
                price_update: PriceUpdate::new(Price::new(basis, value).unwrap(), BidNumber(1)),
            },
        }
    }

    fn sample() -> Vec<Event> {
        vec![
            received("freezer", dec!(2), 1),
            received("pv_panel", dec!(2), 2),
            received("freezer", dec!(4), 3),
        ]
    }

    #[test]
    fn test_filter_by_agent_and_session() {
        let filters = QueryFilters {
            agent: Some("freezer".to_string()),
            ..Default::default()
        };
        assert_eq!(filter_events(sample(), &filters).len(), 2);

        let filters = QueryFilters {
            session: Some("freezer:root#3".to_string()),
            ..Default::default()
        };
        assert_eq!(filter_events(sample(), &filters).len(), 1);

        // whole ids only: #1 does not pick up #10
        let mut events = sample();
        events.push(received("freezer", dec!(5), 10));
        let filters = QueryFilters {
            session: Some("freezer:root#1".to_string()),
            ..Default::default()
        };
        let matched = filter_events(events, &filters);
        assert_eq!(matched.len(), 1);
        assert_eq!(
            matched[0].session_id,
            Some(SessionId::new(&AgentId::from("freezer"), &AgentId::from("root"), 1))
        );
    }

    #[test]
    fn test_filter_by_event_type() {
        let by_name = QueryFilters {
            event_type: Some("IncomingPriceUpdate".to_string()),
            ..Default::default()
        };
        assert_eq!(filter_events(sample(), &by_name).len(), 3);

        let by_group = QueryFilters {
            event_type: Some("price".to_string()),
            ..Default::default()
        };
        assert_eq!(filter_events(sample(), &by_group).len(), 3);

        let other = QueryFilters {
            event_type: Some("equilibrium".to_string()),
            ..Default::default()
        };
        assert!(filter_events(sample(), &other).is_empty());
    }

    #[test]
    fn test_price_history_and_timeline() {
        assert_eq!(price_history(&sample(), "freezer"), vec![dec!(2), dec!(4)]);
        let chart = price_timeline(&sample(), "freezer", 30);
        assert!(chart.contains("Price Timeline: freezer"));
        assert!(chart.contains("2 updates"));
        assert!(price_timeline(&sample(), "nobody", 30).contains("No prices recorded"));
    }

    #[test]
    fn test_format_query_results() {
        let output = format_query_results(&sample(), false);
        assert!(output.contains("Found 3 events"));
        assert!(output.contains("IncomingPriceUpdate: 3"));
    }
}
