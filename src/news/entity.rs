use serde::{Deserialize, Serialize};

/// Query-building stopwords. A title made purely of these never produces a
/// useful query, and articles whose text reduces to these are rejected.
pub const STOPWORDS: &[&str] = &[
    "will", "the", "a", "an", "of", "in", "on", "at", "to", "by", "be", "is", "are", "was",
    "were", "and", "or", "for", "with", "before", "after", "than", "more", "less", "over",
    "under", "above", "below", "between", "during", "this", "that", "it", "its", "his", "her",
    "their", "what", "when", "who", "how", "why", "yes", "no", "up", "down", "2024", "2025",
    "2026", "market", "price", "odds",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NewsCategory {
    Crypto,
    Macro,
    Elections,
    Geopolitics,
    Sports,
    Entertainment,
    Other,
}

impl NewsCategory {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "crypto" => NewsCategory::Crypto,
            "macro" => NewsCategory::Macro,
            "elections" => NewsCategory::Elections,
            "geopolitics" => NewsCategory::Geopolitics,
            "sports" => NewsCategory::Sports,
            "entertainment" => NewsCategory::Entertainment,
            _ => NewsCategory::Other,
        }
    }
}

/// Entity context grounding news relevance: a canonical entity, its
/// category, and the terms an article must mention.
#[derive(Debug, Clone)]
pub struct EntityContext {
    pub canonical: String,
    pub category: NewsCategory,
    pub terms: Vec<String>,
}

/// `(canonical, aliases)` per category. Categories are tried in this fixed
/// priority order; the first vocabulary with a match wins.
type Vocab = &'static [(&'static str, &'static [&'static str])];

const CRYPTO: Vocab = &[
    ("bitcoin", &["bitcoin", "btc"]),
    ("ethereum", &["ethereum", "eth"]),
    ("solana", &["solana", "sol"]),
    ("dogecoin", &["dogecoin", "doge"]),
    ("xrp", &["xrp", "ripple"]),
    ("crypto", &["crypto", "cryptocurrency", "stablecoin", "defi"]),
];

const MACRO: Vocab = &[
    ("federal reserve", &["fed", "fomc", "federal reserve", "powell", "rate cut", "rate hike"]),
    ("inflation", &["inflation", "cpi", "pce"]),
    ("recession", &["recession", "gdp", "unemployment", "jobs report", "nonfarm"]),
    ("tariffs", &["tariff", "tariffs", "trade war"]),
];

const ELECTIONS: Vocab = &[
    ("presidential election", &["president", "presidential", "election", "electoral"]),
    ("congress", &["senate", "congress", "house race", "governor"]),
    ("primary", &["primary", "nominee", "nomination", "caucus"]),
    ("polling", &["poll", "polls", "approval rating"]),
];

const GEOPOLITICS: Vocab = &[
    ("ukraine war", &["ukraine", "russia", "kyiv", "kremlin"]),
    ("middle east", &["israel", "gaza", "iran", "hezbollah", "houthis"]),
    ("china", &["china", "taiwan", "beijing"]),
    ("conflict", &["war", "ceasefire", "sanctions", "nato", "missile", "invasion"]),
];

const SPORTS: Vocab = &[
    ("nba", &["nba", "basketball"]),
    ("nfl", &["nfl", "super bowl", "football"]),
    ("mlb", &["mlb", "world series", "baseball"]),
    ("soccer", &["premier league", "champions league", "world cup", "fifa"]),
    ("combat sports", &["ufc", "boxing"]),
    ("nhl", &["nhl", "stanley cup", "hockey"]),
];

const ENTERTAINMENT: Vocab = &[
    ("awards", &["oscar", "oscars", "grammy", "grammys", "emmy", "golden globe"]),
    ("film", &["box office", "movie", "film"]),
    ("music", &["album", "billboard", "tour"]),
    ("television", &["season finale", "netflix", "streaming"]),
];

const CATEGORIES: &[(NewsCategory, Vocab)] = &[
    (NewsCategory::Crypto, CRYPTO),
    (NewsCategory::Macro, MACRO),
    (NewsCategory::Elections, ELECTIONS),
    (NewsCategory::Geopolitics, GEOPOLITICS),
    (NewsCategory::Sports, SPORTS),
    (NewsCategory::Entertainment, ENTERTAINMENT),
];

pub fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word.to_ascii_lowercase().as_str())
}

/// Significant tokens from a title: non-stopword words of 3+ chars,
/// original casing preserved.
pub fn significant_tokens(title: &str, max: usize) -> Vec<String> {
    title
        .split(|c: char| !c.is_alphanumeric() && c != '$')
        .filter(|w| w.len() >= 3 && !is_stopword(w))
        .take(max)
        .map(|w| w.to_string())
        .collect()
}

/// Derive an entity context from a market title and slug by matching the
/// fixed vocabularies in priority order. Returns None when nothing matches,
/// letting the caller fall back to the language model.
pub fn derive_entity(title: &str, slug: &str) -> Option<EntityContext> {
    let haystack = format!("{} {}", title.to_ascii_lowercase(), slug.to_ascii_lowercase());

    for (category, vocab) in CATEGORIES {
        let mut canonical: Option<&str> = None;
        let mut matched: Vec<String> = Vec::new();
        for (canon, aliases) in *vocab {
            for alias in *aliases {
                if haystack.contains(alias) {
                    canonical.get_or_insert(canon);
                    matched.push((*alias).to_string());
                }
            }
        }
        if let Some(canonical) = canonical {
            let mut terms = matched;
            for token in significant_tokens(title, 3) {
                let lower = token.to_ascii_lowercase();
                if !terms.iter().any(|t| t.eq_ignore_ascii_case(&lower)) {
                    terms.push(lower);
                }
            }
            terms.truncate(8);
            return Some(EntityContext {
                canonical: canonical.to_string(),
                category: *category,
                terms,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_title_maps_to_bitcoin() {
        let e = derive_entity("Will BTC hit $150k before July?", "btc-150k-july").unwrap();
        assert_eq!(e.canonical, "bitcoin");
        assert_eq!(e.category, NewsCategory::Crypto);
        assert!(e.terms.iter().any(|t| t == "btc"));
    }

    #[test]
    fn category_priority_prefers_crypto_over_macro() {
        // Mentions both "bitcoin" and "fed"; crypto is tried first.
        let e = derive_entity("Will the Fed decision move Bitcoin?", "fed-bitcoin").unwrap();
        assert_eq!(e.category, NewsCategory::Crypto);
    }

    #[test]
    fn elections_and_geopolitics_match() {
        let e = derive_entity("Who wins the presidential election?", "pres-2028").unwrap();
        assert_eq!(e.category, NewsCategory::Elections);

        let e = derive_entity("Ceasefire in Gaza before March?", "gaza-ceasefire").unwrap();
        assert_eq!(e.category, NewsCategory::Geopolitics);
        assert_eq!(e.canonical, "middle east");
    }

    #[test]
    fn unmatched_title_returns_none() {
        assert!(derive_entity("Will it rain tomorrow?", "rain-tomorrow").is_none());
    }

    #[test]
    fn slug_alone_can_match() {
        let e = derive_entity("Above 97?", "eth-above-97").unwrap();
        assert_eq!(e.canonical, "ethereum");
    }

    #[test]
    fn significant_tokens_skip_stopwords() {
        let tokens = significant_tokens("Will the Lakers win more than 50 games", 5);
        assert!(tokens.iter().any(|t| t == "Lakers"));
        assert!(!tokens.iter().any(|t| t.eq_ignore_ascii_case("will")));
        assert!(!tokens.iter().any(|t| t.eq_ignore_ascii_case("the")));
    }
}
