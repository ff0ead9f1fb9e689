use tracing::debug;

use crate::llm::LanguageModel;
use crate::types::{MovementRow, SignalClass};

/// Deterministic narrative for a movement. The first sentence is always
/// "Price moved N% over T" so the live stream can substitute the market
/// title for event movements.
pub fn template_explanation(
    mv: &MovementRow,
    class: SignalClass,
    headlines: &[String],
    subject: Option<&str>,
) -> String {
    let pct = mv.pct_change * 100.0;
    let mut text = format!(
        "Price moved {pct:+.1}% over {} on ${:.0} volume across {} trades.",
        mv.window_type, mv.window_volume, mv.trades_count
    );

    match class {
        SignalClass::Capital => {
            text.push_str(&format!(
                " Flow ran {:.1}x the market's usual pace.",
                mv.volume_ratio.max(mv.hourly_ratio)
            ));
        }
        SignalClass::Velocity => {
            text.push_str(" The move was unusually fast for this window.");
        }
        SignalClass::Liquidity => {
            text.push_str(" Liquidity was thin, so the print sizes overstate conviction.");
        }
        SignalClass::News => {
            text.push_str(" Coverage volume suggests a news-driven repricing.");
        }
        SignalClass::Info => {
            text.push_str(" Price led volume, consistent with traders repricing on information.");
        }
        SignalClass::Time => {
            text.push_str(" Resolution is approaching, which compresses uncertainty.");
        }
    }

    if !headlines.is_empty() {
        let cited: Vec<String> = headlines
            .iter()
            .take(3)
            .map(|h| format!("\"{h}\""))
            .collect();
        text.push_str(&format!(" Related coverage: {}.", cited.join("; ")));
    }

    match subject {
        Some(subject) => format!("{subject}: {text}"),
        None => text,
    }
}

/// Narrative generation: language model when available, template on any
/// failure. Returns `(text, source)` with source ∈ {"ai", "template"}.
pub async fn generate(
    llm: Option<&dyn LanguageModel>,
    mv: &MovementRow,
    class: SignalClass,
    headlines: &[String],
    subject: Option<&str>,
) -> (String, &'static str) {
    let template = template_explanation(mv, class, headlines, subject);

    let Some(llm) = llm else {
        return (template, "template");
    };

    let prompt = format!(
        "Market movement: {} {} moved {:+.1}% over {} (volume ${:.0}, {} trades, classified {}). \
         Headlines: {}. Write one short neutral sentence explaining the move.",
        mv.market_id,
        mv.outcome,
        mv.pct_change * 100.0,
        mv.window_type,
        mv.window_volume,
        mv.trades_count,
        class.as_str(),
        headlines.join(" | "),
    );
    match llm.explain_movement(&prompt).await {
        Ok(text) if !text.trim().is_empty() => (text, "ai"),
        Ok(_) => (template, "template"),
        Err(e) => {
            debug!(movement_id = %mv.id, "llm explanation failed, using template: {e}");
            (template, "template")
        }
    }
}

/// Substitute a market title into the leading "Price moved" sentence.
/// Used by the live stream when enriching event movements.
pub fn substitute_market(text: &str, market_title: &str) -> String {
    match text.strip_prefix("Price moved") {
        Some(rest) => format!("{market_title} moved{rest}"),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ms_to_iso;

    fn movement() -> MovementRow {
        MovementRow {
            id: "m1:Yes:5m:1".to_string(),
            market_id: "m1".to_string(),
            outcome: "Yes".to_string(),
            window_type: "5m".to_string(),
            window_start: ms_to_iso(0),
            window_end: ms_to_iso(300_000),
            start_price: 0.40,
            end_price: 0.50,
            min_price: 0.40,
            max_price: 0.50,
            pct_change: 0.25,
            range_pct: 0.25,
            window_volume: 1_000.0,
            volume_ratio: 2.0,
            hourly_ratio: 1.5,
            trades_count: 20,
            price_levels: 6,
            avg_trade_size: 50.0,
            velocity: 0.1,
            reason: "BOTH".to_string(),
            thin_liquidity: false,
            status: "FINAL".to_string(),
            finalize_at: ms_to_iso(900_000),
        }
    }

    #[test]
    fn template_leads_with_the_price_sentence() {
        let text = template_explanation(&movement(), SignalClass::Capital, &[], None);
        assert!(text.starts_with("Price moved +25.0% over 5m"));
        assert!(text.contains("$1000 volume"));
        assert!(text.contains("20 trades"));
    }

    #[test]
    fn headlines_are_cited_up_to_three() {
        let headlines: Vec<String> = (0..5).map(|i| format!("Headline {i}")).collect();
        let text = template_explanation(&movement(), SignalClass::News, &headlines, None);
        assert!(text.contains("\"Headline 0\""));
        assert!(text.contains("\"Headline 2\""));
        assert!(!text.contains("\"Headline 3\""));
    }

    #[test]
    fn subject_prefixes_event_explanations() {
        let text = template_explanation(
            &movement(),
            SignalClass::Info,
            &[],
            Some("Will the Fed cut in September?"),
        );
        assert!(text.starts_with("Will the Fed cut in September?: Price moved"));
    }

    #[test]
    fn market_substitution_rewrites_first_sentence() {
        let text = "Price moved +12.0% over 1h on $500 volume across 9 trades.";
        let out = substitute_market(text, "Fed cuts by 50bp");
        assert!(out.starts_with("Fed cuts by 50bp moved +12.0% over 1h"));

        // Non-matching text passes through untouched.
        assert_eq!(substitute_market("Other text", "X"), "Other text");
    }
}
