// Post-filter that restores the exact boolean semantics lost by linear remote queries
use crate::layers::condition::ConditionModel;
use crate::layers::Paper;

pub const CS_PREFIX: &str = "cs.";

pub struct ResultFilter;

impl ResultFilter {
    /// Papers cross-listed outside computer science, or with no tags at all, are not pure CS.
    pub fn is_pure_cs(paper: &Paper) -> bool {
        !paper.categories.is_empty()
            && paper
                .categories
                .iter()
                .all(|category| category.trim().starts_with(CS_PREFIX))
    }

    pub fn pure_cs(papers: Vec<Paper>) -> Vec<Paper> {
        papers.into_iter().filter(Self::is_pure_cs).collect()
    }

    pub fn filter(papers: Vec<Paper>, model: &ConditionModel) -> Vec<Paper> {
        let mut kept: Vec<Paper> = papers
            .into_iter()
            .filter(Self::is_pure_cs)
            .filter(|paper| model.is_satisfied_by(paper))
            .collect();
        kept.sort_by(|a, b| b.published.cmp(&a.published).then_with(|| b.id.cmp(&a.id)));
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::testing::{model, paper};
    use proptest::prelude::*;

    #[test]
    fn test_pure_cs() {
        assert!(ResultFilter::is_pure_cs(&paper("1", "t", "", &["cs.CL", "cs.AI"], "2025-01-01")));
        assert!(!ResultFilter::is_pure_cs(&paper("2", "t", "", &["cs.LG", "stat.ML"], "2025-01-01")));
        assert!(!ResultFilter::is_pure_cs(&paper("3", "t", "", &["physics.comp-ph"], "2025-01-01")));
        assert!(!ResultFilter::is_pure_cs(&paper("4", "t", "", &[], "2025-01-01")));
    }

    #[test]
    fn test_transformer_vision_scenario() {
        let model = ConditionModel::parse("required: transformer optional: vision or language").unwrap();
        let papers = vec![
            paper("1", "Transformer for vision in plasma", "", &["cs.CV", "physics.plasm-ph"], "2025-01-01"),
            paper("2", "A vision transformer", "", &["cs.CV"], "2025-01-01"),
            paper("3", "Transformer compression", "", &["cs.LG"], "2025-01-01"),
        ];
        let kept = ResultFilter::filter(papers, &model);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "2");
    }

    #[test]
    fn test_orders_newest_first() {
        let papers = vec![
            paper("2501.00001", "a", "", &["cs.AI"], "2025-01-01"),
            paper("2501.00003", "b", "", &["cs.AI"], "2025-01-02"),
            paper("2501.00002", "c", "", &["cs.AI"], "2025-01-02"),
        ];
        let ids: Vec<_> = ResultFilter::filter(papers, &ConditionModel::default())
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, ["2501.00003", "2501.00002", "2501.00001"]);
    }

    proptest! {
        #[test]
        fn filter_is_idempotent(m in model(), flags in prop::collection::vec(0u8..8, 0..10)) {
            let words = ["agent", "llm", "vision", "language model", "graph", "robot", "diffusion", "rl"];
            let papers: Vec<Paper> = flags
                .iter()
                .enumerate()
                .map(|(i, f)| {
                    let categories: &[&str] = if f % 3 == 0 { &["cs.AI", "q-bio.NC"] } else { &["cs.AI"] };
                    let title = format!("{} {}", words[*f as usize], words[(i + 3) % words.len()]);
                    paper(&i.to_string(), &title, words[(i * 5) % words.len()], categories, "2025-01-01")
                })
                .collect();
            let once = ResultFilter::filter(papers, &m);
            let twice = ResultFilter::filter(once.clone(), &m);
            prop_assert_eq!(once, twice);
        }
    }
}
