//! Claim extraction from tool results.
//!
//! Tools that follow the service convention return a `claims` array
//! alongside their payload. For research-style results without one, claims
//! are derived from result entries carrying a URL.

use serde_json::Value;

use cox_domain::claim::Claim;

/// Extract the claims table from a tool result.
pub fn extract_claims(tool: &str, result: &Value) -> Vec<Claim> {
    // Preferred: an explicit claims array.
    if let Some(rows) = result.get("claims").and_then(Value::as_array) {
        return rows.iter().filter_map(parse_claim_row).collect();
    }

    // Fallback: derive from result/listing entries that carry a URL.
    let mut claims = Vec::new();
    for key in ["results", "listings", "items"] {
        if let Some(rows) = result.get(key).and_then(Value::as_array) {
            for row in rows {
                if let Some(claim) = derive_claim(tool, row) {
                    claims.push(claim);
                }
            }
        }
    }
    claims
}

fn parse_claim_row(row: &Value) -> Option<Claim> {
    let text = row
        .get("text")
        .or_else(|| row.get("claim"))
        .and_then(Value::as_str)?
        .to_string();
    let source = row
        .get("source")
        .or_else(|| row.get("url"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    Some(Claim {
        text,
        confidence: row
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0),
        source,
        ttl_secs: row.get("ttl").and_then(Value::as_u64),
    })
}

/// Build a claim out of a listing-style entry: title/name + price + url.
fn derive_claim(tool: &str, row: &Value) -> Option<Claim> {
    let url = row.get("url").and_then(Value::as_str)?.to_string();
    let title = row
        .get("title")
        .or_else(|| row.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("result");
    let text = match row.get("price").and_then(Value::as_str) {
        Some(price) => format!("{title} listed at {price}"),
        None => title.to_string(),
    };
    Some(Claim {
        text,
        confidence: 0.6,
        source: if url.is_empty() { tool.to_string() } else { url },
        ttl_secs: None,
    })
}
