use crate::data::cache::DedupStore;
use crate::data::types::{CanonicalRecord, RawTip, Team};

/// Identity of a tip for deduplication.
///
/// `alerted` is rounded to cents so float noise past the second decimal does
/// not produce a new identity.
pub fn dedup_key(tip: &RawTip) -> String {
    let alerted = (tip.alerted * 100.0).round() / 100.0;
    format!(
        "{}-{}-{}-{}-{}-{}-{:.2}",
        tip.id, tip.league_id, tip.market, tip.outcome, tip.period, tip.point, alerted
    )
}

/// Markets are moneyline, spread, total and teamtotal.
fn market_type(market: &str) -> String {
    let market = market.to_lowercase();
    if market == "teamtotal" {
        "team_totals".to_string()
    } else {
        market
    }
}

/// Split `awayover`-style outcomes into a team and a direction.
fn split_outcome(outcome: &str) -> (Option<Team>, String) {
    let outcome = outcome.to_lowercase();
    match outcome.as_str() {
        "awayover" => (Some(Team::Away), "over".to_string()),
        "awayunder" => (Some(Team::Away), "under".to_string()),
        "homeover" => (Some(Team::Home), "over".to_string()),
        "homeunder" => (Some(Team::Home), "under".to_string()),
        _ => (None, outcome),
    }
}

/// Convert a tip into a record, or `None` if its identity was already emitted.
pub fn normalize(tip: RawTip, store: &DedupStore) -> Option<CanonicalRecord> {
    let key = dedup_key(&tip);
    if store.contains(&key) {
        return None;
    }

    let (team, outcome) = split_outcome(&tip.outcome);
    let record = CanonicalRecord {
        market_type: market_type(&tip.market),
        is_first_half: tip.period != 0,
        team,
        outcome,
        points: tip.point,
        odds: tip.nvp,
        home: tip.home,
        away: tip.away,
    };

    // Another holder of the store may have claimed the key since the check.
    if !store.claim(key) {
        return None;
    }

    Some(record)
}
