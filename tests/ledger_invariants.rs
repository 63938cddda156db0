//! Ledger invariants under randomized trade sequences.
//!
//! A seeded RNG drives valid BUY/SELL streams against the ledger while a
//! simple in-memory FIFO model tracks what the ledger should contain.
//! After every operation the two are compared, which checks:
//!   - cash identity      (cash = start - sum buys + sum sells, exactly)
//!   - non-negative positions
//!   - FIFO closure       (open lots always match the model's queue)
//!   - P&L conservation   (realized == sell notional - matched buy notional)
//! All comparisons are Decimal-exact: any float drift anywhere in the
//! accounting path fails the run.

use std::collections::VecDeque;

use paperbot::ledger::{ExecOutcome, ExecReceipt, TradeLedger};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn must_exec(outcome: ExecOutcome) -> ExecReceipt {
    match outcome {
        ExecOutcome::Executed(r) => r,
        ExecOutcome::Refused(r) => panic!("unexpected refusal: {}", r.as_str()),
    }
}

/// Random price in [10.00, 500.00] with exactly two decimal places.
fn random_price(rng: &mut StdRng) -> Decimal {
    Decimal::new(rng.gen_range(1_000..50_000), 2)
}

/// Reference FIFO book: (qty, price) lots in arrival order.
#[derive(Default)]
struct Model {
    lots: VecDeque<(i64, Decimal)>,
    cash: Decimal,
    realized: Decimal,
}

impl Model {
    fn new(starting_cash: Decimal) -> Self {
        Self { lots: VecDeque::new(), cash: starting_cash, realized: Decimal::ZERO }
    }

    fn open_qty(&self) -> i64 {
        self.lots.iter().map(|(q, _)| q).sum()
    }

    fn buy(&mut self, qty: i64, price: Decimal) {
        self.cash -= price * Decimal::from(qty);
        self.lots.push_back((qty, price));
    }

    fn sell(&mut self, mut qty: i64, price: Decimal) -> Decimal {
        self.cash += price * Decimal::from(qty);
        let mut pnl = Decimal::ZERO;
        while qty > 0 {
            let (lot_qty, lot_price) = self.lots.pop_front().expect("model underflow");
            let matched = qty.min(lot_qty);
            pnl += (price - lot_price) * Decimal::from(matched);
            if matched < lot_qty {
                self.lots.push_front((lot_qty - matched, lot_price));
            }
            qty -= matched;
        }
        self.realized += pnl;
        pnl
    }
}

fn assert_matches_model(ledger: &TradeLedger, model: &Model, step: usize) {
    // Cash identity, Decimal-exact.
    assert_eq!(
        ledger.cash_balance().unwrap(),
        model.cash,
        "cash diverged at step {step}"
    );

    // Non-negative position and FIFO book equality.
    let open = ledger.open_lots("AAPL").unwrap();
    let got: Vec<(i64, Decimal)> = open.iter().map(|l| (l.qty, l.price)).collect();
    let want: Vec<(i64, Decimal)> = model.lots.iter().cloned().collect();
    assert_eq!(got, want, "open lot queue diverged at step {step}");
    assert!(ledger.open_quantity("AAPL").unwrap() >= 0);

    // Open lots must be in non-decreasing opened_at order.
    for pair in open.windows(2) {
        assert!(pair[0].opened_at <= pair[1].opened_at);
    }
}

// ---------------------------------------------------------------------------
// Randomized sequences
// ---------------------------------------------------------------------------

#[test]
fn randomized_trade_stream_holds_all_invariants() {
    for seed in 0..5u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let starting_cash = d("100000");
        let mut ledger = TradeLedger::new(":memory:", starting_cash).unwrap();
        let mut model = Model::new(starting_cash);

        for step in 0..200 {
            let price = random_price(&mut rng);
            let now = 1_000 + step as i64;
            let open = model.open_qty();

            if open > 0 && rng.gen_bool(0.4) {
                let qty = rng.gen_range(1..=open);
                let receipt = must_exec(ledger.sell("AAPL", qty, price, "fuzz", now).unwrap());
                let expected_pnl = model.sell(qty, price);
                assert_eq!(receipt.realized_pnl, expected_pnl, "pnl diverged at step {step}");
            } else {
                let qty = rng.gen_range(1..=20);
                let notional = price * Decimal::from(qty);
                if model.cash < notional {
                    // Ledger must refuse exactly when the model says so.
                    let outcome = ledger.buy("AAPL", qty, price, "fuzz", now).unwrap();
                    assert!(matches!(outcome, ExecOutcome::Refused(_)));
                    continue;
                }
                must_exec(ledger.buy("AAPL", qty, price, "fuzz", now).unwrap());
                model.buy(qty, price);
            }

            assert_matches_model(&ledger, &model, step);
        }

        // Flatten, then check global P&L conservation: with every lot
        // matched, realized == sum(sell notional) - sum(buy notional),
        // which is exactly the cash delta.
        let open = model.open_qty();
        if open > 0 {
            let price = random_price(&mut rng);
            let receipt = must_exec(ledger.sell("AAPL", open, price, "flatten", 10_000).unwrap());
            let expected = model.sell(open, price);
            assert_eq!(receipt.realized_pnl, expected);
        }
        assert_matches_model(&ledger, &model, usize::MAX);
        assert_eq!(
            ledger.cash_balance().unwrap() - starting_cash,
            model.realized,
            "fully-matched realized P&L must equal the cash delta (seed {seed})"
        );
    }
}

#[test]
fn win_rate_counts_closed_lots() {
    let mut ledger = TradeLedger::new(":memory:", d("100000")).unwrap();
    // Lot 1 wins, lot 2 loses, lot 3 breaks even.
    must_exec(ledger.buy("AAPL", 1, d("100"), "t", 1).unwrap());
    must_exec(ledger.sell("AAPL", 1, d("110"), "t", 2).unwrap());
    must_exec(ledger.buy("AAPL", 1, d("100"), "t", 3).unwrap());
    must_exec(ledger.sell("AAPL", 1, d("90"), "t", 4).unwrap());
    must_exec(ledger.buy("AAPL", 1, d("100"), "t", 5).unwrap());
    must_exec(ledger.sell("AAPL", 1, d("100"), "t", 6).unwrap());

    let summary = ledger.bankroll(&Default::default()).unwrap();
    assert_eq!(summary.total_trades, 6);
    assert!((summary.win_rate_pct - 100.0 / 3.0).abs() < 1e-9);
    assert_eq!(summary.realized_pnl, d("0.00"));
}

#[test]
fn ledger_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.sqlite");
    let path = path.to_str().unwrap();

    {
        let mut ledger = TradeLedger::new(path, d("100000")).unwrap();
        must_exec(ledger.buy("AAPL", 5, d("100"), "t", 1).unwrap());
    }
    let ledger = TradeLedger::new(path, d("100000")).unwrap();
    assert_eq!(ledger.open_quantity("AAPL").unwrap(), 5);
    assert_eq!(ledger.cash_balance().unwrap(), d("99500"));
}
