
use assert_cmd::prelude::*;
use cli_helpers::{base_cmd, run_cmd, run_cmd_json, stdout, TestEnv};
use predicates::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;
use std::str::FromStr;

const AAPL_ROWS: &str = "2025-01-10,AAPL,BUY,10,150,INR,IN\n\
                         2025-03-05,AAPL,BUY,10,160,INR,IN\n\
                         2025-06-20,AAPL,SELL,5,170,INR,IN\n";

fn decimal(value: &Value) -> Decimal {
    Decimal::from_str(value.as_str().expect("decimal serialized as string")).unwrap()
}

fn consolidated_env() -> TestEnv {
    let env = TestEnv::new();
    env.write_source("trades_broker.csv", AAPL_ROWS);
    run_cmd(&env, &["consolidate"]).unwrap();
    env
}

#[test]
fn status_on_empty_workspace() {
    let env = TestEnv::new();

    base_cmd(&env)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Ledger rows:"))
        .stdout(predicate::str::contains("empty"))
        .stdout(predicate::str::contains("\u{001b}[").not());
}

#[test]
fn consolidate_writes_ledger_and_manifest() {
    let env = TestEnv::new();
    env.write_source("trades_broker.csv", AAPL_ROWS);

    let report = run_cmd_json(&env, &["consolidate"]).unwrap();
    assert_eq!(report["absorbed"][0]["file"], "trades_broker.csv");
    assert_eq!(report["absorbed"][0]["rows"], 3);
    assert_eq!(report["ledger_rows"], 3);
    assert_eq!(report["ledger_written"], true);
    assert!(env.path("tradebook.csv").is_file());
    assert!(env.path("tradebook_processed_files.json").is_file());

    let status = run_cmd_json(&env, &["status"]).unwrap();
    assert_eq!(status["ledger_rows"], 3);
    assert_eq!(status["first_trade"], "2025-01-10");
    assert_eq!(status["last_trade"], "2025-06-20");
    assert_eq!(status["source_files"], 1);
}

#[test]
fn consolidate_twice_leaves_ledger_untouched() {
    let env = consolidated_env();
    let before = std::fs::read(env.path("tradebook.csv")).unwrap();

    let report = run_cmd_json(&env, &["consolidate"]).unwrap();
    assert_eq!(report["absorbed"].as_array().unwrap().len(), 0);
    assert_eq!(report["unchanged"][0], "trades_broker.csv");
    assert_eq!(report["ledger_written"], false);
    assert_eq!(std::fs::read(env.path("tradebook.csv")).unwrap(), before);
}

#[test]
fn malformed_file_is_reported_without_blocking_others() {
    let env = TestEnv::new();
    env.write_source("trades_good.csv", "2025-01-10,INFY,BUY,10,1500,INR,IN\n");
    std::fs::write(
        env.sources_dir().join("trades_bad.csv"),
        "Date,Ticker,Qty\n2025-01-10,TCS,5\n",
    )
    .unwrap();

    let report = run_cmd_json(&env, &["consolidate"]).unwrap();
    assert_eq!(report["ledger_rows"], 1);
    let rejected = report["rejected"].as_array().unwrap();
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].as_str().unwrap().contains("trades_bad.csv"));
}

#[test]
fn usd_trades_use_fallback_rate_override() {
    let env = TestEnv::new();
    env.write_source("trades_us.csv", "2025-01-10,MSFT,BUY,2,400,USD,US\n");

    let mut cmd = base_cmd(&env);
    cmd.env("FALLBACK_USD_INR_RATE", "83")
        .args(["consolidate", "--json"])
        .assert()
        .success();

    let ledger = std::fs::read_to_string(env.path("tradebook.csv")).unwrap();
    assert!(ledger.lines().nth(1).unwrap().ends_with(",83"), "ledger: {}", ledger);
}

#[test]
fn summary_from_cached_year_end_price() {
    let env = consolidated_env();
    env.write_price_cache("AAPL,2025-12-31,165\n");

    let summary = run_cmd_json(&env, &["summary", "--at", "2025-12-31"]).unwrap();
    assert_eq!(summary["as_of"], "2025-12-31");
    assert_eq!(decimal(&summary["total_invested"]), dec!(2350));
    assert_eq!(decimal(&summary["current_value"]), dec!(2475));
    assert_eq!(decimal(&summary["unrealized_profit"]), dec!(125));
    assert_eq!(decimal(&summary["realized_profit"]), dec!(100));
    assert_eq!(summary["holdings_count"], 1);
    assert!(summary["unpriced"].as_array().unwrap().is_empty());
    assert!(summary["annualized_return"].as_f64().is_some());
}

#[test]
fn summary_without_prices_reports_unpriced() {
    let env = consolidated_env();

    let summary = run_cmd_json(&env, &["summary", "--at", "2025"]).unwrap();
    assert_eq!(summary["unpriced"][0], "AAPL");
    assert_eq!(decimal(&summary["current_value"]), Decimal::ZERO);
    assert_eq!(decimal(&summary["realized_profit"]), dec!(100));
}

#[test]
fn holdings_table_has_no_ansi_when_piped() {
    let env = consolidated_env();
    env.write_price_cache("AAPL,2025-12-31,165\n");

    base_cmd(&env)
        .args(["holdings", "--at", "2025-12-31"])
        .assert()
        .success()
        .stdout(predicate::str::contains("AAPL"))
        .stdout(predicate::str::contains("Avg Cost"))
        .stdout(predicate::str::contains("\u{001b}[").not());
}

#[test]
fn snapshot_list_is_empty_initially() {
    let env = TestEnv::new();

    base_cmd(&env)
        .args(["snapshot", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No snapshots yet"));
}

#[test]
fn snapshot_write_verify_and_list() {
    let env = consolidated_env();

    run_cmd(&env, &["snapshot", "write", "2025"]).unwrap();
    assert!(env
        .data_dir()
        .join("snapshots")
        .join("holdings_snapshot_2025-12-31.csv")
        .is_file());

    let verify = run_cmd_json(&env, &["snapshot", "verify", "2025"]).unwrap();
    assert_eq!(verify["consistent"], true);

    let list = run_cmd_json(&env, &["snapshot", "list"]).unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["cutoff"], "2025-12-31");
    assert_eq!(list[0]["instruments"], 1);

    // A second write for the same year is refused
    base_cmd(&env)
        .args(["snapshot", "write", "2025"])
        .assert()
        .failure();
}

#[test]
fn snapshot_write_refuses_unfinished_year() {
    let env = consolidated_env();

    base_cmd(&env)
        .args(["snapshot", "write", "2100"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("has not ended"));
}

#[test]
fn summary_resumes_from_snapshot() {
    let env = consolidated_env();
    run_cmd(&env, &["snapshot", "write", "2025"]).unwrap();
    env.write_price_cache("AAPL,2025-12-31,165\n");

    let summary = run_cmd_json(&env, &["summary", "--at", "2025-12-31"]).unwrap();
    assert_eq!(summary["resumed_from"], "2025-12-31");
    assert_eq!(decimal(&summary["total_invested"]), dec!(2350));
    assert_eq!(decimal(&summary["current_value"]), dec!(2475));
}

#[test]
fn rebuild_regenerates_ledger_and_snapshots() {
    let env = consolidated_env();
    std::fs::remove_file(env.path("tradebook.csv")).unwrap();

    let report = run_cmd_json(&env, &["rebuild"]).unwrap();
    assert_eq!(report["consolidation"]["ledger_rows"], 3);
    let written = report["written"].as_array().unwrap();
    assert!(written.iter().any(|c| c == "2025-12-31"));
    assert!(env.path("tradebook.csv").is_file());

    let again = stdout(&run_cmd(&env, &["rebuild", "--skip-snapshots"]).unwrap());
    assert!(again.contains("trades_broker.csv"));
}

#[test]
fn invalid_date_is_rejected() {
    let env = TestEnv::new();

    base_cmd(&env)
        .args(["summary", "--at", "31/12/2025"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid date"));
}
