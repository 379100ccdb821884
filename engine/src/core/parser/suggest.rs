//! "Did you mean" suggestions for unknown prompt ids.

/// Edit distance between two strings (case-insensitive).
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Closest candidate within a distance budget scaled to the input length.
///
/// Prefix matches win over edit distance so `anal` suggests `analyze`.
pub fn closest_match<'a, I>(input: &str, candidates: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let needle = input.to_lowercase();
    let budget = (needle.chars().count() / 3).max(2);
    let mut best: Option<(usize, &str)> = None;
    for candidate in candidates {
        let lowered = candidate.to_lowercase();
        let distance = if lowered.starts_with(&needle) && !needle.is_empty() {
            0
        } else {
            levenshtein(&needle, &lowered)
        };
        if distance > budget {
            continue;
        }
        match best {
            Some((d, c)) if d < distance || (d == distance && c <= candidate) => {}
            _ => best = Some((distance, candidate)),
        }
    }
    best.map(|(_, c)| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_counts_single_edits() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("Same", "same"), 0);
        assert_eq!(levenshtein("", "abc"), 3);
    }

    #[test]
    fn suggests_transposed_id() {
        let ids = ["analyze", "summarize", "review"];
        assert_eq!(closest_match("anaylze", ids), Some("analyze".to_string()));
    }

    #[test]
    fn no_suggestion_for_unrelated_input() {
        let ids = ["analyze", "summarize"];
        assert_eq!(closest_match("zzzzzzzzz", ids), None);
    }
}
