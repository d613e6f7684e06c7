use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::events::{Event, EventType};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub agent_id: String,

    pub sessions_opened: usize,
    pub sessions_closed: usize,

    pub bids_sent: usize,
    pub bids_accepted: usize,
    pub bids_rejected: usize,

    pub prices_sent: usize,
    pub prices_received: usize,
    pub prices_rejected: usize,

    pub last_price: Option<Decimal>,
    pub lowest_price: Option<Decimal>,
    pub highest_price: Option<Decimal>,
    pub average_price: Option<Decimal>,
    pub price_volatility: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMetrics {
    pub total_events: usize,
    pub agents: HashMap<String, AgentMetrics>,
    pub equilibria: usize,
    pub unbounded_equilibria: usize,
    pub last_equilibrium: Option<Decimal>,
    pub average_equilibrium: Option<Decimal>,
    pub stale_rejections: usize,
    /// Share of prices sent that reached their addressee.
    pub delivery_ratio: f64,
}

pub struct MetricsCalculator;

impl MetricsCalculator {
    pub fn calculate_agent_metrics(agent_id: &str, events: &[Event]) -> AgentMetrics {
        let mut metrics = AgentMetrics {
            agent_id: agent_id.to_string(),
            ..Default::default()
        };
        let mut prices = Vec::new();

        for event in events.iter().filter(|e| e.agent_id.as_str() == agent_id) {
            match &event.event_type {
                EventType::SessionConnected { .. } => metrics.sessions_opened += 1,
                EventType::SessionDisconnected { .. } => metrics.sessions_closed += 1,
                EventType::OutgoingBidUpdate { .. } => metrics.bids_sent += 1,
                EventType::IncomingBidUpdate { .. } => metrics.bids_accepted += 1,
                EventType::BidRejected { .. } => metrics.bids_rejected += 1,
                EventType::OutgoingPriceUpdate { .. } => metrics.prices_sent += 1,
                EventType::IncomingPriceUpdate { price_update } => {
                    metrics.prices_received += 1;
                    prices.push(price_update.price.value());
                }
                EventType::PriceRejected { .. } => metrics.prices_rejected += 1,
                EventType::EquilibriumComputed { .. } => {}
            }
        }

        metrics.last_price = prices.last().copied();
        metrics.lowest_price = prices.iter().min().copied();
        metrics.highest_price = prices.iter().max().copied();
        if !prices.is_empty() {
            let sum: Decimal = prices.iter().sum();
            let average = sum / Decimal::from(prices.len());
            metrics.average_price = Some(average);

            let mean = average.to_f64().unwrap_or(0.0);
            let variance = prices
                .iter()
                .map(|p| (p.to_f64().unwrap_or(0.0) - mean).powi(2))
                .sum::<f64>()
                / prices.len() as f64;
            metrics.price_volatility = variance.sqrt();
        }

        metrics
    }

    pub fn calculate_cluster_metrics(events: &[Event]) -> ClusterMetrics {
        let agent_ids: BTreeSet<&str> = events.iter().map(|e| e.agent_id.as_str()).collect();
        let agents: HashMap<String, AgentMetrics> = agent_ids
            .into_iter()
            .map(|id| (id.to_string(), Self::calculate_agent_metrics(id, events)))
            .collect();

        let mut equilibria = Vec::new();
        let mut unbounded_equilibria = 0;
        for event in events {
            if let EventType::EquilibriumComputed {
                price_update,
                clearing,
            } = &event.event_type
            {
                equilibria.push(price_update.price.value());
                if clearing.is_unbounded() {
                    unbounded_equilibria += 1;
                }
            }
        }

        let average_equilibrium = if equilibria.is_empty() {
            None
        } else {
            Some(equilibria.iter().sum::<Decimal>() / Decimal::from(equilibria.len()))
        };

        let prices_sent: usize = agents.values().map(|a| a.prices_sent).sum();
        let prices_received: usize = agents.values().map(|a| a.prices_received).sum();
        let delivery_ratio = if prices_sent > 0 {
            prices_received as f64 / prices_sent as f64
        } else {
            0.0
        };

        ClusterMetrics {
            total_events: events.len(),
            stale_rejections: agents.values().map(|a| a.prices_rejected).sum(),
            agents,
            equilibria: equilibria.len(),
            unbounded_equilibria,
            last_equilibrium: equilibria.last().copied(),
            average_equilibrium,
            delivery_ratio,
        }
    }
}

fn price_or_dash(price: Option<Decimal>) -> String {
    price.map_or_else(|| "-".to_string(), |p| p.to_string())
}

impl std::fmt::Display for AgentMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Agent {} Metrics:", self.agent_id)?;
        writeln!(
            f,
            "  - Sessions: {} opened, {} closed",
            self.sessions_opened, self.sessions_closed
        )?;
        writeln!(
            f,
            "  - Bids: {} sent, {} accepted, {} rejected",
            self.bids_sent, self.bids_accepted, self.bids_rejected
        )?;
        writeln!(
            f,
            "  - Prices: {} sent, {} received, {} rejected",
            self.prices_sent, self.prices_received, self.prices_rejected
        )?;
        writeln!(
            f,
            "  - Last price: {} (range {} to {}, σ={:.2})",
            price_or_dash(self.last_price),
            price_or_dash(self.lowest_price),
            price_or_dash(self.highest_price),
            self.price_volatility
        )?;
        Ok(())
    }
}

impl std::fmt::Display for ClusterMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Cluster Metrics ({} events):", self.total_events)?;
        writeln!(
            f,
            "  Equilibria: {} ({} unbounded)",
            self.equilibria, self.unbounded_equilibria
        )?;
        writeln!(
            f,
            "  Last Equilibrium: {}",
            price_or_dash(self.last_equilibrium)
        )?;
        writeln!(
            f,
            "  Average Equilibrium: {}",
            price_or_dash(self.average_equilibrium.map(|p| p.round_dp(4)))
        )?;
        writeln!(f, "  Stale Price Rejections: {}", self.stale_rejections)?;
        writeln!(f, "  Delivery Ratio: {:.1}%", self.delivery_ratio * 100.0)?;
        writeln!(f, "\nLast Price per Agent:")?;
        let mut sorted_agents: Vec<_> = self.agents.iter().collect();
        sorted_agents.sort_by(|a, b| a.0.cmp(b.0));
        for (id, metrics) in sorted_agents {
            if metrics.prices_received > 0 {
                writeln!(f, "  {}: {}", id, price_or_dash(metrics.last_price))?;
            }
        }
        Ok(())
    }
}
