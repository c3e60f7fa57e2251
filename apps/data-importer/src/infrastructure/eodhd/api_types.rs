//! EOD Historical Data wire types.
//!
//! The provider is loose with types: numbers arrive as JSON numbers,
//! strings, `"NA"` or `null`, and missing dates as `"0000-00-00"`.
//! Wire structs accept all of these and the `into_*` mappers drop rows
//! whose key fields cannot be read.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::domain::market_data::{
    Dividend, EarningsEvent, Exchange, IpoEvent, OptionChain, OptionContract, OptionType,
    PriceBar, Split, TrendEvent,
};
use crate::domain::symbol::Symbol;

// ============================================================================
// Lenient Scalars
// ============================================================================

fn lenient_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Some(Value::String(s)) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    })
}

#[allow(clippy::cast_possible_truncation)]
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    raw.and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc())
        .or_else(|| parse_date(Some(raw)).map(|d| d.and_time(chrono::NaiveTime::MIN).and_utc()))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

// ============================================================================
// Reference Data
// ============================================================================

/// Row of `/exchanges-list`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExchangeRow {
    pub code: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "OperatingMIC")]
    pub operating_mic: Option<String>,
    pub country: Option<String>,
    pub currency: Option<String>,
}

/// Row of `/exchange-symbol-list/{EX}`.
///
/// `Exchange` here is the listing venue (`NASDAQ`), not the provider
/// exchange code the list was requested for.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SymbolRow {
    pub code: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "Type")]
    pub instrument_type: Option<String>,
}

/// Map exchange rows, skipping rows without a code.
pub fn into_exchanges(rows: Vec<ExchangeRow>) -> Vec<Exchange> {
    rows.into_iter()
        .filter_map(|row| {
            let code = non_blank(row.code)?;
            Some(Exchange {
                name: non_blank(row.name).unwrap_or_else(|| code.clone()),
                code,
                operating_mic: non_blank(row.operating_mic),
                country: non_blank(row.country),
                currency: non_blank(row.currency),
            })
        })
        .collect()
}

/// Map symbol rows for the exchange they were requested for.
pub fn into_symbols(exchange: &str, rows: Vec<SymbolRow>) -> Vec<Symbol> {
    rows.into_iter()
        .filter_map(|row| {
            let code = non_blank(row.code)?;
            Some(Symbol {
                code,
                exchange: exchange.to_string(),
                name: non_blank(row.name),
                instrument_type: non_blank(row.instrument_type),
                is_optionable: false,
            })
        })
        .collect()
}

// ============================================================================
// Corporate Actions
// ============================================================================

/// Row of `/splits/{CODE.EX}`; `split` reads `"4.000000/1.000000"`.
#[derive(Debug, Deserialize)]
pub struct SplitRow {
    pub date: Option<String>,
    pub split: Option<String>,
}

/// Row of `/div/{CODE.EX}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DividendRow {
    pub date: Option<String>,
    pub declaration_date: Option<String>,
    pub record_date: Option<String>,
    pub payment_date: Option<String>,
    pub period: Option<String>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub value: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub unadjusted_value: Option<Decimal>,
    pub currency: Option<String>,
}

/// Map split rows. The ratio string is `after/before`.
pub fn into_splits(symbol: &Symbol, rows: Vec<SplitRow>) -> Vec<Split> {
    rows.into_iter()
        .filter_map(|row| {
            let date = parse_date(row.date.as_deref())?;
            let ratio = row.split?;
            let (after, before) = ratio.split_once('/')?;
            Some(Split {
                code: symbol.code.clone(),
                exchange: symbol.exchange.clone(),
                date,
                before: Decimal::from_str(before.trim()).ok()?,
                after: Decimal::from_str(after.trim()).ok()?,
            })
        })
        .collect()
}

/// Map dividend rows. A missing unadjusted value falls back to `value`.
pub fn into_dividends(symbol: &Symbol, rows: Vec<DividendRow>) -> Vec<Dividend> {
    rows.into_iter()
        .filter_map(|row| {
            let date = parse_date(row.date.as_deref())?;
            let value = row.value?;
            Some(Dividend {
                code: symbol.code.clone(),
                exchange: symbol.exchange.clone(),
                date,
                value,
                unadjusted_value: row.unadjusted_value.unwrap_or(value),
                currency: non_blank(row.currency),
                declaration_date: parse_date(row.declaration_date.as_deref()),
                record_date: parse_date(row.record_date.as_deref()),
                payment_date: parse_date(row.payment_date.as_deref()),
                period: non_blank(row.period),
            })
        })
        .collect()
}

// ============================================================================
// Prices
// ============================================================================

/// Row of `/eod/{CODE.EX}`.
#[derive(Debug, Deserialize)]
pub struct EodRow {
    pub date: Option<String>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub open: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub high: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub low: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub close: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub adjusted_close: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub volume: Option<i64>,
}

/// Map bars. A missing adjusted close falls back to the close.
pub fn into_price_bars(symbol: &Symbol, rows: Vec<EodRow>) -> Vec<PriceBar> {
    rows.into_iter()
        .filter_map(|row| {
            let close = row.close?;
            Some(PriceBar {
                code: symbol.code.clone(),
                exchange: symbol.exchange.clone(),
                date: parse_date(row.date.as_deref())?,
                open: row.open?,
                high: row.high?,
                low: row.low?,
                close,
                adjusted_close: row.adjusted_close.unwrap_or(close),
                volume: row.volume.unwrap_or(0),
            })
        })
        .collect()
}

// ============================================================================
// Options
// ============================================================================

/// Body of `/options/{CODE.EX}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsResponse {
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub last_trade_price: Option<Decimal>,
    pub last_trade_date: Option<String>,
    #[serde(default)]
    pub data: Vec<ExpirationRow>,
}

/// One expiration with its calls and puts, keyed `CALL` / `PUT`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpirationRow {
    pub expiration_date: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, Vec<ContractRow>>,
}

/// One contract.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractRow {
    pub contract_name: Option<String>,
    #[serde(rename = "type")]
    pub option_type: Option<String>,
    pub expiration_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub strike: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub last_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub bid: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub ask: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub volume: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub open_interest: Option<i64>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub implied_volatility: Option<Decimal>,
}

fn option_type(raw: &str) -> Option<OptionType> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "CALL" | "C" => Some(OptionType::Call),
        "PUT" | "P" => Some(OptionType::Put),
        _ => None,
    }
}

/// Flatten a chain across expirations.
pub fn into_option_chain(symbol: &Symbol, response: OptionsResponse) -> OptionChain {
    let mut contracts = Vec::new();
    for expiration in response.data {
        let expiry = parse_date(expiration.expiration_date.as_deref());
        for (side, rows) in expiration.options {
            let side = option_type(&side);
            contracts.extend(rows.into_iter().filter_map(|row| {
                Some(OptionContract {
                    contract_name: non_blank(row.contract_name)?,
                    option_type: row.option_type.as_deref().and_then(option_type).or(side)?,
                    expiration_date: parse_date(row.expiration_date.as_deref()).or(expiry)?,
                    strike: row.strike?,
                    last_price: row.last_price,
                    bid: row.bid,
                    ask: row.ask,
                    volume: row.volume,
                    open_interest: row.open_interest,
                    implied_volatility: row.implied_volatility,
                })
            }));
        }
    }

    OptionChain {
        code: symbol.code.clone(),
        exchange: symbol.exchange.clone(),
        last_trade_price: response.last_trade_price,
        updated_at: parse_timestamp(response.last_trade_date.as_deref()),
        contracts,
    }
}

// ============================================================================
// Calendar
// ============================================================================

/// Body of `/calendar/earnings`.
#[derive(Debug, Deserialize)]
pub struct EarningsResponse {
    #[serde(default)]
    pub earnings: Vec<EarningsRow>,
}

/// One earnings entry; `code` carries an exchange suffix (`AAPL.US`).
#[derive(Debug, Deserialize)]
pub struct EarningsRow {
    pub code: Option<String>,
    pub report_date: Option<String>,
    pub date: Option<String>,
    pub before_after_market: Option<String>,
    pub currency: Option<String>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub actual: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub estimate: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub difference: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub percent: Option<Decimal>,
}

/// Body of `/calendar/ipos`.
#[derive(Debug, Deserialize)]
pub struct IposResponse {
    #[serde(default)]
    pub ipos: Vec<IpoRow>,
}

/// One IPO entry.
#[derive(Debug, Deserialize)]
pub struct IpoRow {
    pub code: Option<String>,
    pub name: Option<String>,
    pub exchange: Option<String>,
    pub currency: Option<String>,
    pub start_date: Option<String>,
    pub filing_date: Option<String>,
    pub deal_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub price_from: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub price_to: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub offer_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub shares: Option<i64>,
}

/// Body of `/calendar/trends`; one group per requested symbol.
#[derive(Debug, Deserialize)]
pub struct TrendsResponse {
    #[serde(default)]
    pub trends: Vec<TrendGroup>,
}

/// A symbol's rows, or a lone row when only one period is reported.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TrendGroup {
    Many(Vec<TrendRow>),
    One(TrendRow),
}

/// One trend entry; `code` carries an exchange suffix.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendRow {
    pub code: Option<String>,
    pub date: Option<String>,
    pub period: Option<String>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub growth: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub earnings_estimate_avg: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub earnings_estimate_low: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub earnings_estimate_high: Option<Decimal>,
    #[serde(
        rename = "earningsEstimateNumberOfAnalysts",
        default,
        deserialize_with = "lenient_i64"
    )]
    pub earnings_estimate_analysts: Option<i64>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub revenue_estimate_avg: Option<Decimal>,
    #[serde(
        rename = "revenueEstimateNumberOfAnalysts",
        default,
        deserialize_with = "lenient_i64"
    )]
    pub revenue_estimate_analysts: Option<i64>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub eps_trend_current: Option<Decimal>,
    #[serde(rename = "epsTrend30daysAgo", default, deserialize_with = "lenient_decimal")]
    pub eps_trend_30_days_ago: Option<Decimal>,
    #[serde(rename = "epsRevisionsUpLast30days", default, deserialize_with = "lenient_i64")]
    pub eps_revisions_up_30_days: Option<i64>,
    #[serde(rename = "epsRevisionsDownLast30days", default, deserialize_with = "lenient_i64")]
    pub eps_revisions_down_30_days: Option<i64>,
}

/// Strip an exchange suffix: `AAPL.US` -> `AAPL`.
fn bare_code(code: &str) -> &str {
    code.rsplit_once('.').map_or(code, |(bare, _)| bare)
}

/// Map earnings rows. Codes lose their exchange suffix; the exchange is
/// resolved later against the symbol registry.
pub fn into_earnings(response: EarningsResponse) -> Vec<EarningsEvent> {
    response
        .earnings
        .into_iter()
        .filter_map(|row| {
            let code = non_blank(row.code)?;
            Some(EarningsEvent {
                code: bare_code(code.trim()).to_string(),
                report_date: parse_date(row.report_date.as_deref())?,
                date: parse_date(row.date.as_deref())?,
                before_after_market: non_blank(row.before_after_market),
                currency: non_blank(row.currency),
                actual: row.actual,
                estimate: row.estimate,
                difference: row.difference,
                percent: row.percent,
            })
        })
        .collect()
}

/// Flatten trend groups. Rows need a code, a date and a period.
pub fn into_trends(response: TrendsResponse) -> Vec<TrendEvent> {
    response
        .trends
        .into_iter()
        .flat_map(|group| match group {
            TrendGroup::Many(rows) => rows,
            TrendGroup::One(row) => vec![row],
        })
        .filter_map(|row| {
            let code = non_blank(row.code)?;
            Some(TrendEvent {
                code: bare_code(code.trim()).to_string(),
                date: parse_date(row.date.as_deref())?,
                period: non_blank(row.period)?,
                growth: row.growth,
                earnings_estimate_avg: row.earnings_estimate_avg,
                earnings_estimate_low: row.earnings_estimate_low,
                earnings_estimate_high: row.earnings_estimate_high,
                earnings_estimate_analysts: row.earnings_estimate_analysts,
                revenue_estimate_avg: row.revenue_estimate_avg,
                revenue_estimate_analysts: row.revenue_estimate_analysts,
                eps_trend_current: row.eps_trend_current,
                eps_trend_30_days_ago: row.eps_trend_30_days_ago,
                eps_revisions_up_30_days: row.eps_revisions_up_30_days,
                eps_revisions_down_30_days: row.eps_revisions_down_30_days,
            })
        })
        .collect()
}

/// Map IPO rows, skipping rows without a code or exchange.
pub fn into_ipos(response: IposResponse) -> Vec<IpoEvent> {
    response
        .ipos
        .into_iter()
        .filter_map(|row| {
            let code = non_blank(row.code)?;
            Some(IpoEvent {
                code: bare_code(code.trim()).to_string(),
                name: non_blank(row.name),
                exchange: non_blank(row.exchange)?,
                currency: non_blank(row.currency),
                start_date: parse_date(row.start_date.as_deref()),
                filing_date: parse_date(row.filing_date.as_deref()),
                deal_type: non_blank(row.deal_type),
                price_from: row.price_from,
                price_to: row.price_to,
                offer_price: row.offer_price,
                shares: row.shares,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn aapl() -> Symbol {
        Symbol::new("AAPL", "US")
    }

    #[test]
    fn split_ratio_string_is_after_over_before() {
        let rows: Vec<SplitRow> =
            serde_json::from_str(r#"[{"date":"2020-08-31","split":"4.000000/1.000000"}]"#)
                .unwrap();
        let splits = into_splits(&aapl(), rows);
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].after, dec("4.000000"));
        assert_eq!(splits[0].before, dec("1.000000"));
        assert_eq!(splits[0].ratio(), dec("4"));
    }

    #[test]
    fn dividends_accept_numbers_strings_and_zero_dates() {
        let json = r#"[
            {"date":"2024-02-09","declarationDate":"2024-02-01","recordDate":"0000-00-00",
             "paymentDate":null,"period":"Quarterly","value":0.24,"unadjustedValue":"0.24","currency":"USD"},
            {"date":"bogus","value":1.0}
        ]"#;
        let rows: Vec<DividendRow> = serde_json::from_str(json).unwrap();
        let dividends = into_dividends(&aapl(), rows);

        assert_eq!(dividends.len(), 1);
        let dividend = &dividends[0];
        assert_eq!(dividend.value, dec("0.24"));
        assert_eq!(dividend.unadjusted_value, dec("0.24"));
        assert_eq!(dividend.record_date, None);
        assert_eq!(dividend.payment_date, None);
        assert_eq!(dividend.period.as_deref(), Some("Quarterly"));
    }

    #[test]
    fn eod_rows_default_adjusted_close() {
        let json = r#"[{"date":"2024-01-02","open":187.15,"high":188.44,"low":183.89,
                        "close":185.64,"volume":82488700}]"#;
        let rows: Vec<EodRow> = serde_json::from_str(json).unwrap();
        let bars = into_price_bars(&aapl(), rows);
        assert_eq!(bars[0].adjusted_close, bars[0].close);
        assert_eq!(bars[0].volume, 82_488_700);
    }

    #[test]
    fn symbol_list_uses_requested_exchange() {
        let json = r#"[{"Code":"AAPL","Name":"Apple Inc","Exchange":"NASDAQ","Type":"Common Stock"},
                       {"Code":"","Name":"blank"}]"#;
        let rows: Vec<SymbolRow> = serde_json::from_str(json).unwrap();
        let symbols = into_symbols("US", rows);
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].exchange, "US");
        assert_eq!(symbols[0].instrument_type.as_deref(), Some("Common Stock"));
    }

    #[test]
    fn option_chain_flattens_expirations() {
        let json = r#"{
            "code":"AAPL","exchange":"US","lastTradeDate":"2024-03-01","lastTradePrice":179.66,
            "data":[{"expirationDate":"2024-03-15","options":{
                "CALL":[{"contractName":"AAPL240315C00180000","strike":180,"bid":"2.1","ask":2.15,
                         "volume":"NA","openInterest":1200}],
                "PUT":[{"contractName":"AAPL240315P00180000","type":"PUT","strike":180}]
            }}]
        }"#;
        let response: OptionsResponse = serde_json::from_str(json).unwrap();
        let chain = into_option_chain(&aapl(), response);

        assert_eq!(chain.contracts.len(), 2);
        assert!(chain.updated_at.is_some());
        let call = &chain.contracts[0];
        assert_eq!(call.option_type, OptionType::Call);
        assert_eq!(call.bid, Some(dec("2.1")));
        assert_eq!(call.volume, None);
        assert_eq!(call.open_interest, Some(1200));
        assert_eq!(chain.contracts[1].option_type, OptionType::Put);
        assert_eq!(
            call.expiration_date,
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
        );
    }

    #[test]
    fn earnings_codes_lose_suffix() {
        let json = r#"{"type":"Earnings","earnings":[
            {"code":"AAPL.US","report_date":"2024-02-01","date":"2023-12-31",
             "before_after_market":"AfterMarket","actual":2.18,"estimate":2.1}
        ]}"#;
        let response: EarningsResponse = serde_json::from_str(json).unwrap();
        let events = into_earnings(response);
        assert_eq!(events[0].code, "AAPL");
        assert_eq!(events[0].actual, Some(dec("2.18")));
    }

    #[test]
    fn ipos_need_an_exchange() {
        let json = r#"{"type":"IPOs","ipos":[
            {"code":"NEWCO.US","name":"NewCo","exchange":"Nasdaq","shares":"1000000"},
            {"code":"NOEX","name":"Nowhere","exchange":null}
        ]}"#;
        let response: IposResponse = serde_json::from_str(json).unwrap();
        let ipos = into_ipos(response);
        assert_eq!(ipos.len(), 1);
        assert_eq!(ipos[0].code, "NEWCO");
        assert_eq!(ipos[0].exchange, "Nasdaq");
        assert_eq!(ipos[0].shares, Some(1_000_000));
    }

    #[test]
    fn trends_flatten_groups() {
        let json = r#"{"type":"Trends","symbols":"AAPL.US,MSFT.US","trends":[
            [{"code":"AAPL.US","date":"2024-06-30","period":"0q","growth":"0.0735",
              "earningsEstimateAvg":"1.3400","earningsEstimateNumberOfAnalysts":"28",
              "epsTrend30daysAgo":"1.3500","epsRevisionsDownLast30days":"2"},
             {"code":"AAPL.US","date":"2024-09-30","period":"+1q"}],
            {"code":"MSFT.US","date":"2024-06-30","period":"0q","epsTrendCurrent":2.9},
            [{"code":"NOPE.US","date":"2024-06-30"}]
        ]}"#;
        let response: TrendsResponse = serde_json::from_str(json).unwrap();
        let trends = into_trends(response);

        assert_eq!(trends.len(), 3);
        assert_eq!(trends[0].code, "AAPL");
        assert_eq!(trends[0].growth, Some(dec("0.0735")));
        assert_eq!(trends[0].earnings_estimate_analysts, Some(28));
        assert_eq!(trends[0].eps_trend_30_days_ago, Some(dec("1.3500")));
        assert_eq!(trends[0].eps_revisions_down_30_days, Some(2));
        assert_eq!(trends[1].period, "+1q");
        assert_eq!(trends[2].code, "MSFT");
        assert_eq!(trends[2].eps_trend_current, Some(dec("2.9")));
    }
}
