use serde::Serialize;

use crate::enrich::price::PriceRow;
use crate::enrich::token::TokenMetadataRecord;

/// Human-facing token metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDisplay {
    pub name: String,
    pub symbol: String,
    /// Logo URL from the price service; empty when unknown.
    pub logo: String,
    /// Icon key the UI falls back to when there is no logo.
    pub symbol_icon: String,
    pub color: String,
}

/// Fallback palette for tokens without a brand color.
const PALETTE: [&str; 8] = [
    "#5C6BC0", "#26A69A", "#EF5350", "#AB47BC", "#FFA726", "#42A5F5", "#8D6E63", "#66BB6A",
];

/// Known chain IDs → human-readable names.
pub fn chain_name(chain_id: u64) -> String {
    match chain_id {
        1 => "Ethereum".to_string(),
        10 => "Optimism".to_string(),
        56 => "BNB Chain".to_string(),
        97 => "BNB Testnet".to_string(),
        137 => "Polygon".to_string(),
        8453 => "Base".to_string(),
        42000 => "Helios".to_string(),
        42161 => "Arbitrum One".to_string(),
        43113 => "Avalanche Fuji".to_string(),
        43114 => "Avalanche".to_string(),
        80002 => "Polygon Amoy".to_string(),
        11155111 => "Sepolia".to_string(),
        _ => format!("Chain {chain_id}"),
    }
}

/// Brand colors for well-known symbols (lowercase).
fn brand_color(symbol: &str) -> Option<&'static str> {
    match symbol {
        "hls" | "ahelios" => Some("#002DCB"),
        "eth" | "weth" => Some("#627EEA"),
        "usdt" => Some("#26A17B"),
        "usdc" => Some("#2775CA"),
        "bnb" | "wbnb" => Some("#F3BA2F"),
        "pol" | "matic" => Some("#8247E5"),
        "avax" | "wavax" => Some("#E84142"),
        "link" => Some("#2A5ADA"),
        "dai" => Some("#F5AC37"),
        _ => None,
    }
}

/// Deterministic color for any symbol.
pub fn token_color(symbol: &str) -> String {
    let lower = symbol.to_lowercase();
    if let Some(color) = brand_color(&lower) {
        return color.to_string();
    }
    let hash = lower
        .bytes()
        .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    PALETTE[hash % PALETTE.len()].to_string()
}

/// Build display metadata from the chain record and an optional price row.
pub fn token_display(record: &TokenMetadataRecord, price: Option<&PriceRow>) -> TokenDisplay {
    let symbol = record.symbol.trim().to_uppercase();
    let name = if record.name.trim().is_empty() {
        symbol.clone()
    } else {
        record.name.trim().to_string()
    };
    let logo = price.map(|p| p.logo.clone()).unwrap_or_default();

    TokenDisplay {
        name,
        symbol_icon: format!("token-{}", symbol.to_lowercase()),
        color: token_color(&symbol),
        symbol,
        logo,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(symbol: &str, name: &str) -> TokenMetadataRecord {
        serde_json::from_value(serde_json::json!({
            "address": "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed",
            "symbol": symbol,
            "name": name,
            "decimals": 18
        }))
        .unwrap()
    }

    #[test]
    fn test_chain_name() {
        assert_eq!(chain_name(1), "Ethereum");
        assert_eq!(chain_name(42000), "Helios");
        assert_eq!(chain_name(99999), "Chain 99999");
    }

    #[test]
    fn test_brand_and_palette_colors() {
        assert_eq!(token_color("USDT"), "#26A17B");
        let first = token_color("ZZZ");
        assert_eq!(first, token_color("zzz"));
        assert!(PALETTE.contains(&first.as_str()));
    }

    #[test]
    fn test_display_falls_back_to_symbol() {
        let display = token_display(&record("wbtc", ""), None);
        assert_eq!(display.name, "WBTC");
        assert_eq!(display.symbol, "WBTC");
        assert_eq!(display.logo, "");
        assert_eq!(display.symbol_icon, "token-wbtc");
    }

    #[test]
    fn test_display_uses_price_logo() {
        let row = PriceRow {
            price: 1.0,
            logo: "https://logos.example/usdc.png".to_string(),
        };
        let display = token_display(&record("USDC", "USD Coin"), Some(&row));
        assert_eq!(display.name, "USD Coin");
        assert_eq!(display.logo, "https://logos.example/usdc.png");
        assert_eq!(display.color, "#2775CA");
    }
}
