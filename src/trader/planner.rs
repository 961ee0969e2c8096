//! Turns the strategy's requests into the minimal set of broker calls.
//!
//! Each side keeps at most one resting order. An order that already matches
//! the request (same price tick, size within one minimum order) is left
//! alone; everything else is replaced or cancelled.

use crate::exchange::{MarketInfo, NewOrder, Order};
use crate::trading::{LimitOrder, ScheduledOrder, Side};
use crate::utils::{round_down_to_step, same_tick};

pub struct PlanInput<'a> {
    pub pair: &'a str,
    pub magic: &'a str,
    pub market: &'a MarketInfo,
    /// Resting orders carrying this trader's tag.
    pub own_orders: &'a [Order],
    pub buy: Option<LimitOrder>,
    pub sell: Option<LimitOrder>,
    pub market_order: Option<f64>,
    /// Uncommitted fills, signed.
    pub unconfirmed: f64,
}

#[derive(Debug, Clone, Default)]
pub struct OrderPlan {
    /// Broker requests with the side they belong to.
    pub entries: Vec<(Side, NewOrder)>,
    /// Resting orders left untouched.
    pub kept: Vec<Order>,
    /// Fill totals at which the uncommitted position is committed.
    pub target_buy: Option<f64>,
    pub target_sell: Option<f64>,
}

impl OrderPlan {
    pub fn orders(&self) -> Vec<NewOrder> {
        self.entries.iter().map(|(_, o)| o.clone()).collect()
    }

    fn set_target(&mut self, side: Side, target: Option<f64>) {
        match side {
            Side::Buy => self.target_buy = target,
            Side::Sell => self.target_sell = target,
        }
    }
}

/// True when `live` already implements `desired`.
pub fn is_same_order(live: &Order, desired: &ScheduledOrder, market: &MarketInfo) -> bool {
    live.size.signum() == desired.size.signum()
        && same_tick(live.price, desired.price, market.currency_step)
        && (live.size - desired.size).abs() < market.min_order_size(desired.price)
}

pub fn plan_orders(input: &PlanInput<'_>) -> OrderPlan {
    let mut plan = OrderPlan::default();
    plan_side(input, Side::Buy, input.buy, &mut plan);
    plan_side(input, Side::Sell, input.sell, &mut plan);

    if let Some(size) = input.market_order.filter(|s| *s != 0.0) {
        if let Some(side) = Side::of_size(size) {
            let filled = (input.unconfirmed * side.sign()).max(0.0);
            plan.set_target(side, Some(filled + size.abs()));
            plan.entries.push((
                side,
                NewOrder {
                    pair: input.pair.to_string(),
                    size,
                    price: None,
                    client_id: Some(input.magic.to_string()),
                    replace_id: None,
                    replace_expected_size: None,
                },
            ));
        }
    }
    plan
}

fn plan_side(input: &PlanInput<'_>, side: Side, request: Option<LimitOrder>, plan: &mut OrderPlan) {
    let market = input.market;
    let live: Vec<&Order> = input
        .own_orders
        .iter()
        .filter(|o| Side::of_size(o.size) == Some(side))
        .collect();
    let first = live.first().copied();
    let filled = (input.unconfirmed * side.sign()).max(0.0);
    let filled_target = (filled > 0.0).then_some(filled);

    let desired = match request {
        Some(req) => {
            let residual = round_down_to_step(req.size - input.unconfirmed * side.sign(), market.asset_step);
            if residual < market.min_order_size(req.price) {
                plan.set_target(side, filled_target);
                None
            } else {
                plan.set_target(side, Some(req.size));
                Some(ScheduledOrder {
                    price: req.price,
                    size: residual * side.sign(),
                    replace_id: first.map(|o| o.id.clone()),
                    replace_expected_size: first.map(|o| o.size),
                })
            }
        }
        None => {
            plan.set_target(side, filled_target);
            None
        }
    };

    match (desired, first) {
        (Some(d), Some(o)) if is_same_order(o, &d, market) => plan.kept.push(o.clone()),
        (Some(d), _) => plan.entries.push((
            side,
            NewOrder {
                pair: input.pair.to_string(),
                size: d.size,
                price: Some(d.price),
                client_id: Some(input.magic.to_string()),
                replace_id: d.replace_id,
                replace_expected_size: d.replace_expected_size,
            },
        )),
        (None, Some(o)) => plan.entries.push((side, NewOrder::cancel(input.pair, o))),
        (None, None) => {}
    }

    for extra in live.iter().skip(1) {
        plan.entries.push((side, NewOrder::cancel(input.pair, extra)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::FeeScheme;

    fn market() -> MarketInfo {
        MarketInfo {
            asset_symbol: "BTC".to_string(),
            currency_symbol: "USD".to_string(),
            asset_step: 0.1,
            currency_step: 0.5,
            min_size: 1.0,
            min_volume: 0.0,
            fees: 0.0,
            fee_scheme: FeeScheme::Currency,
            leverage: 0.0,
            invert_price: false,
            wallet_id: "main".to_string(),
        }
    }

    fn order(id: &str, size: f64, price: f64) -> Order {
        Order {
            id: id.to_string(),
            client_id: Some("tag".to_string()),
            size,
            price,
        }
    }

    fn input<'a>(m: &'a MarketInfo, own: &'a [Order]) -> PlanInput<'a> {
        PlanInput {
            pair: "BTCUSD",
            magic: "tag",
            market: m,
            own_orders: own,
            buy: None,
            sell: None,
            market_order: None,
            unconfirmed: 0.0,
        }
    }

    #[test]
    fn test_matching_orders_need_no_calls() {
        let m = market();
        let own = vec![order("b", 10.0, 99.0), order("s", -10.0, 101.0)];
        let mut inp = input(&m, &own);
        inp.buy = Some(LimitOrder { price: 99.0, size: 10.5 });
        inp.sell = Some(LimitOrder { price: 101.0, size: 10.0 });

        let plan = plan_orders(&inp);
        assert!(plan.entries.is_empty());
        assert_eq!(plan.kept.len(), 2);
        assert_eq!(plan.target_buy, Some(10.5));
    }

    #[test]
    fn test_replan_after_placement_is_idempotent() {
        let m = market();
        let mut inp = input(&m, &[]);
        inp.buy = Some(LimitOrder { price: 98.0, size: 5.0 });
        let first = plan_orders(&inp);
        assert_eq!(first.entries.len(), 1);

        // the broker now shows exactly what was placed
        let (_, placed) = &first.entries[0];
        let own = vec![order("P1", placed.size, placed.price.unwrap())];
        let mut again = input(&m, &own);
        again.buy = inp.buy;
        assert!(plan_orders(&again).entries.is_empty());
    }

    #[test]
    fn test_moved_price_replaces_with_guard() {
        let m = market();
        let own = vec![order("b", 10.0, 99.0)];
        let mut inp = input(&m, &own);
        inp.buy = Some(LimitOrder { price: 98.0, size: 10.0 });

        let plan = plan_orders(&inp);
        let (side, o) = &plan.entries[0];
        assert_eq!(*side, Side::Buy);
        assert_eq!(o.replace_id.as_deref(), Some("b"));
        assert_eq!(o.replace_expected_size, Some(10.0));
        assert_eq!(o.price, Some(98.0));
    }

    #[test]
    fn test_residual_accounts_for_fills() {
        let m = market();
        let mut inp = input(&m, &[]);
        inp.buy = Some(LimitOrder { price: 98.0, size: 10.0 });
        inp.unconfirmed = 4.0;

        let plan = plan_orders(&inp);
        assert_eq!(plan.entries[0].1.size, 6.0);
        assert_eq!(plan.target_buy, Some(10.0));

        // residual below the minimum: commit what was filled
        inp.unconfirmed = 9.5;
        let plan = plan_orders(&inp);
        assert!(plan.entries.is_empty());
        assert_eq!(plan.target_buy, Some(9.5));
    }

    #[test]
    fn test_unrequested_side_and_duplicates_are_cancelled() {
        let m = market();
        let own = vec![order("s1", -2.0, 101.0), order("s2", -2.0, 102.0)];
        let plan = plan_orders(&input(&m, &own));
        assert_eq!(plan.entries.len(), 2);
        assert!(plan.entries.iter().all(|(_, o)| o.is_cancel()));
        assert_eq!(plan.target_sell, None);
    }
}
