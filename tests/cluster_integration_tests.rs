//! End-to-end tests of bid aggregation and price dissemination through a cluster.

use chrono::{Duration, Utc};
use gridmatch::agents::MatcherEndpoint;
use gridmatch::config::AgentConfig;
use gridmatch::equilibrium::Clearing;
use gridmatch::events::EventType;
use gridmatch::runner::run_scenario;
use gridmatch::scenario::create_standard_scenarios;
use gridmatch::session::lock_session;
use gridmatch::types::{AgentId, BidNumber, ClusterId};
use gridmatch::{Bid, Cluster, MarketBasis, MatcherError, Price, PriceUpdate};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn basis() -> MarketBasis {
    MarketBasis::new("electricity", "EUR", 11, dec!(0), dec!(10)).unwrap()
}

fn bid(values: &[i64]) -> Bid {
    Bid::from_demand(basis(), values.iter().map(|v| Decimal::from(*v)).collect()).unwrap()
}

fn id(name: &str) -> AgentId {
    AgentId::from(name)
}

/// root <- concentrator <- {pv_panel, freezer}, no rate limits.
fn basic_cluster() -> Cluster {
    let configs = vec![
        AgentConfig::auctioneer("root", basis()).with_min_interval_ms(0),
        AgentConfig::concentrator("concentrator", "root").with_min_interval_ms(0),
        AgentConfig::device("pv_panel", "concentrator"),
        AgentConfig::device("freezer", "concentrator"),
    ];
    Cluster::from_configs(ClusterId::new("test"), &configs, Utc::now()).unwrap()
}

fn auctioneer_demand(cluster: &Cluster) -> Vec<Decimal> {
    cluster
        .auctioneer()
        .unwrap()
        .aggregate()
        .bid()
        .demand()
        .to_vec()
}

#[test]
fn test_equilibrium_reaches_every_device() {
    let cluster = basic_cluster();
    let now = Utc::now();
    cluster
        .update_bid(&id("pv_panel"), bid(&[0, -1, -2, -3, -4, -5, -6, -7, -8, -9, -10]), now)
        .unwrap();
    cluster
        .update_bid(&id("freezer"), bid(&[2; 11]), now)
        .unwrap();

    let equilibrium = cluster.auctioneer().unwrap().last_equilibrium().unwrap();
    assert_eq!(equilibrium.price_update.price.value(), dec!(2));
    assert_eq!(equilibrium.clearing, Clearing::Cleared);

    // each device is answered with its own bid number
    assert_eq!(
        cluster.last_price(&id("freezer")),
        Some(PriceUpdate::new(Price::new(basis(), dec!(2)).unwrap(), BidNumber(1)))
    );
    assert_eq!(
        cluster.last_price(&id("pv_panel")).map(|p| p.price.value()),
        Some(dec!(2))
    );
}

#[test]
fn test_aggregation_does_not_depend_on_arrival_order() {
    let bids = [
        ("pv_panel", bid(&[0, -1, -2, -3, -4, -5, -6, -7, -8, -9, -10])),
        ("freezer", bid(&[3, 3, 2, 2, 1, 1, 0, 0, 0, 0, 0])),
    ];

    let forward = basic_cluster();
    for (device, b) in bids.iter() {
        forward.update_bid(&id(device), b.clone(), Utc::now()).unwrap();
    }
    let backward = basic_cluster();
    for (device, b) in bids.iter().rev() {
        backward.update_bid(&id(device), b.clone(), Utc::now()).unwrap();
    }

    assert_eq!(auctioneer_demand(&forward), auctioneer_demand(&backward));
    assert_eq!(
        forward.concentrator(&id("concentrator")).unwrap().aggregate(),
        backward.concentrator(&id("concentrator")).unwrap().aggregate()
    );
}

#[test]
fn test_disconnected_child_leaves_the_aggregate() {
    let cluster = basic_cluster();
    let now = Utc::now();
    cluster
        .update_bid(&id("pv_panel"), bid(&[-1; 11]), now)
        .unwrap();
    cluster.update_bid(&id("freezer"), bid(&[2; 11]), now).unwrap();
    assert_eq!(auctioneer_demand(&cluster), vec![dec!(1); 11]);

    assert!(cluster.disconnect(&id("freezer"), now));
    assert_eq!(auctioneer_demand(&cluster), vec![dec!(-1); 11]);
    let concentrator = cluster.concentrator(&id("concentrator")).unwrap();
    let (_, forwarded) = concentrator.last_forwarded().unwrap();
    assert!(!forwarded.references_agent(&id("freezer")));

    // a bid completing after the disconnect is refused
    assert!(matches!(
        cluster.update_bid(&id("freezer"), bid(&[5; 11]), now),
        Err(MatcherError::SessionClosed(_))
    ));
    assert_eq!(auctioneer_demand(&cluster), vec![dec!(-1); 11]);
}

#[test]
fn test_stale_price_is_rejected_and_reported() {
    let cluster = basic_cluster();
    let now = Utc::now();
    let freezer = id("freezer");
    cluster.update_bid(&freezer, bid(&[2; 11]), now).unwrap();
    cluster.update_bid(&freezer, bid(&[1; 11]), now).unwrap();
    let delivered = cluster.events().incoming_price_updates(&freezer).len();

    let session = cluster.session(&freezer).unwrap();
    let stale = PriceUpdate::new(Price::new(basis(), dec!(5)).unwrap(), BidNumber(1));
    let result = lock_session(&session).update_price(stale.clone(), now);
    assert!(matches!(
        result,
        Err(MatcherError::StalePrice {
            expected: Some(BidNumber(2)),
            received: BidNumber(1),
            ..
        })
    ));

    assert_eq!(cluster.events().rejected_price_updates(&freezer), vec![stale]);
    assert_eq!(cluster.events().incoming_price_updates(&freezer).len(), delivered);
}

#[test]
fn test_peak_shaving_through_the_cluster() {
    let report = run_scenario(
        create_standard_scenarios().remove("peak_shaving").unwrap(),
        Utc::now(),
    )
    .unwrap();
    assert!(report.failed_steps.is_empty(), "{:?}", report.failed_steps);

    // the root only ever sees the clamped curve of the shaved subtree
    let from_shaver: Vec<Bid> = report
        .events
        .incoming_bid_updates(&id("auctioneer"))
        .into_iter()
        .filter(|(child, _)| child == &id("shaver"))
        .map(|(_, update)| update.bid)
        .collect();
    assert_eq!(
        from_shaver.last(),
        Some(&bid(&[1, 1, 0, -1, -1, -1, -1, -1, -1, -1, -1]))
    );

    // the factory pushes the root to the maximum price; the shaver remaps it
    let root_prices = report
        .events
        .incoming_price_updates(&id("factory"));
    assert_eq!(root_prices.last().map(|p| p.price.value()), Some(dec!(10)));

    let shaved_prices = report.events.incoming_price_updates(&id("heat_pump"));
    let values: Vec<Decimal> = shaved_prices.iter().map(|p| p.price.value()).collect();
    assert_eq!(values, vec![dec!(2), dec!(3)]);
}

#[test]
fn test_replayed_bid_is_idempotent() {
    let cluster = basic_cluster();
    let now = Utc::now();
    cluster.update_bid(&id("freezer"), bid(&[2; 11]), now).unwrap();

    let concentrator = cluster.concentrator(&id("concentrator")).unwrap();
    let session_id = cluster.session_id(&id("freezer")).unwrap();
    let update = cluster
        .events()
        .outgoing_bid_updates(&id("freezer"))
        .pop()
        .unwrap();
    let before = concentrator.aggregate();

    let outbound = concentrator
        .submit_bid(&id("freezer"), &session_id, update.clone(), now)
        .unwrap();
    assert!(outbound.is_empty());
    assert_eq!(concentrator.aggregate(), before);

    let accepted = cluster
        .events()
        .incoming_bid_updates(&id("concentrator"))
        .into_iter()
        .filter(|(child, _)| child == &id("freezer"))
        .count();
    assert_eq!(accepted, 1);
}

#[test]
fn test_reconnect_starts_a_fresh_bid_space() {
    let cluster = basic_cluster();
    let now = Utc::now();
    let freezer = id("freezer");
    cluster.update_bid(&freezer, bid(&[2; 11]), now).unwrap();
    cluster.update_bid(&freezer, bid(&[3; 11]), now).unwrap();
    let old_session = cluster.session(&freezer).unwrap();
    let old_id = lock_session(&old_session).id().clone();

    cluster.disconnect(&freezer, now);
    cluster.connect(&freezer, now).unwrap();

    // the current bid is resent with number 1 on the new session
    let new_session = cluster.session(&freezer).unwrap();
    assert_ne!(lock_session(&new_session).id(), &old_id);
    assert_eq!(
        lock_session(&new_session).outstanding_bid_number(),
        Some(BidNumber(1))
    );
    let numbers: Vec<BidNumber> = cluster
        .events()
        .outgoing_bid_updates(&freezer)
        .iter()
        .map(|u| u.bid_number)
        .collect();
    assert_eq!(numbers, vec![BidNumber(1), BidNumber(2), BidNumber(1)]);

    // a price answering the pre-disconnect bid 2 never reaches the device
    let late = PriceUpdate::new(Price::new(basis(), dec!(7)).unwrap(), BidNumber(2));
    assert!(lock_session(&old_session).update_price(late.clone(), now).is_err());
    assert!(lock_session(&new_session).update_price(late, now).is_err());

    // bid 1 is outstanding again, but the old session still refuses it
    let reused = PriceUpdate::new(Price::new(basis(), dec!(7)).unwrap(), BidNumber(1));
    assert!(matches!(
        lock_session(&old_session).update_price(reused, now),
        Err(MatcherError::SessionClosed(_))
    ));
    assert_ne!(
        cluster.last_price(&freezer).map(|p| p.price.value()),
        Some(dec!(7))
    );
}

#[test]
fn test_losing_the_concentrator_disconnects_its_subtree() {
    let cluster = basic_cluster();
    let now = Utc::now();
    cluster
        .update_bid(&id("pv_panel"), bid(&[-2; 11]), now)
        .unwrap();

    cluster.remove_agent(&id("concentrator"), now).unwrap();
    assert!(!cluster.is_connected(&id("pv_panel")));
    assert!(!cluster.is_connected(&id("freezer")));
    assert!(cluster.auctioneer().unwrap().connected_children().is_empty());
    assert_eq!(auctioneer_demand(&cluster), vec![Decimal::ZERO; 11]);
    assert_eq!(
        cluster.connect(&id("pv_panel"), now),
        Err(MatcherError::UnknownAgent(id("concentrator")))
    );
}

#[test]
fn test_auctioneer_restart_rewires_the_tree() {
    let cluster = basic_cluster();
    let now = Utc::now();
    cluster.update_bid(&id("freezer"), bid(&[2; 11]), now).unwrap();

    cluster.remove_agent(&id("root"), now).unwrap();
    for agent in ["concentrator", "pv_panel", "freezer"] {
        assert!(!cluster.is_connected(&id(agent)), "{} still connected", agent);
    }

    cluster
        .add_agent(&AgentConfig::auctioneer("root", basis()).with_min_interval_ms(0))
        .unwrap();
    assert_eq!(cluster.reconcile(now), 3);

    // the freezer's bid is resent and priced again
    assert_eq!(auctioneer_demand(&cluster), vec![dec!(2); 11]);
    assert_eq!(
        cluster.last_price(&id("freezer")).map(|p| p.bid_number),
        Some(BidNumber(1))
    );
}

#[test]
fn test_rate_limited_concentrator_catches_up_on_tick() {
    let configs = vec![
        AgentConfig::auctioneer("root", basis()).with_min_interval_ms(0),
        AgentConfig::concentrator("concentrator", "root").with_min_interval_ms(5_000),
        AgentConfig::device("freezer", "concentrator"),
    ];
    let start = Utc::now();
    let cluster = Cluster::from_configs(ClusterId::new("test"), &configs, start).unwrap();

    cluster
        .update_bid(&id("freezer"), bid(&[2; 11]), start + Duration::seconds(1))
        .unwrap();
    assert_eq!(auctioneer_demand(&cluster), vec![Decimal::ZERO; 11]);
    assert!(cluster.last_price(&id("freezer")).is_none());

    cluster.tick(start + Duration::seconds(5));
    assert_eq!(auctioneer_demand(&cluster), vec![dec!(2); 11]);
    assert_eq!(
        cluster.last_price(&id("freezer")).map(|p| p.price.value()),
        Some(dec!(10))
    );
}

#[test]
fn test_churn_scenario_runs() {
    let report = run_scenario(
        create_standard_scenarios().remove("churn").unwrap(),
        Utc::now(),
    )
    .unwrap();

    // the boiler bids while its concentrator is gone
    assert_eq!(report.failed_steps.len(), 1);
    assert!(report.failed_steps[0].1.contains("closed"));

    let disconnects = report
        .events
        .events()
        .iter()
        .filter(|e| matches!(e.event_type, EventType::SessionDisconnected { .. }))
        .count();
    assert!(disconnects >= 3);
    assert!(!report.events.incoming_price_updates(&id("ev_charger")).is_empty());
}
