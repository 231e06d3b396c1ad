//! Plain-text renderers for detection reports.

use cidrwatch_detect::{CidrMatch, Recipe};
use cidrwatch_filter::RejectStage;
use cidrwatch_net::Cidr;

pub struct Report {
    pub tries: Vec<TrieReport>,
    pub active_bans: Vec<Cidr>,
    pub parsed: u64,
    pub malformed: u64,
}

pub struct TrieReport {
    pub name: String,
    pub admitted: u64,
    pub drops: [u64; 8],
    pub recipes: Vec<RecipeReport>,
}

pub struct RecipeReport {
    pub recipe: Recipe,
    pub matches: Vec<CidrMatch>,
}

fn recipe_label(recipe: &Recipe) -> String {
    format!(
        "{},{},{},{:.2}",
        recipe.min_size, recipe.min_depth, recipe.max_depth, recipe.threshold
    )
}

/// The table renderer behind `--plain`.
pub fn render_plain(report: &Report) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{} requests parsed, {} malformed\n",
        report.parsed, report.malformed
    ));

    for trie in &report.tries {
        out.push_str(&format!(
            "\ntrie '{}': {} requests admitted\n",
            trie.name, trie.admitted
        ));
        let drops: Vec<String> = RejectStage::ALL
            .iter()
            .zip(trie.drops.iter())
            .filter(|(_, count)| **count > 0)
            .map(|(stage, count)| format!("{}={}", stage.as_str(), count))
            .collect();
        if !drops.is_empty() {
            out.push_str(&format!("  dropped: {}\n", drops.join(" ")));
        }
        for recipe_report in &trie.recipes {
            out.push_str(&format!(
                "  recipe [{}]{}\n",
                recipe_label(&recipe_report.recipe),
                if recipe_report.recipe.use_for_jail {
                    ""
                } else {
                    " (observe only)"
                }
            ));
            if recipe_report.matches.is_empty() {
                out.push_str("    no ranges detected\n");
            }
            for m in &recipe_report.matches {
                out.push_str(&format!(
                    "    {:<18} {:>10} {:>7.2}%\n",
                    m.cidr.to_string(),
                    m.count,
                    m.percentage * 100.0
                ));
            }
        }
    }

    out.push_str(&format!("\nactive bans ({})\n", report.active_bans.len()));
    for cidr in &report.active_bans {
        out.push_str(&format!("  {}\n", cidr));
    }
    out
}

/// One line per detected range, machine-friendly: `--compact`.
pub fn render_compact(report: &Report) -> String {
    let mut out = String::new();
    for trie in &report.tries {
        for recipe_report in &trie.recipes {
            for m in &recipe_report.matches {
                out.push_str(&format!(
                    "{}\t{}\t{}\t{}\t{:.4}\n",
                    trie.name,
                    recipe_label(&recipe_report.recipe),
                    m.cidr,
                    m.count,
                    m.percentage
                ));
            }
        }
    }
    for cidr in &report.active_bans {
        out.push_str(&format!("ban\t{}\n", cidr));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> Report {
        let recipe = Recipe::new(100, 8, 32, 0.1).unwrap();
        Report {
            tries: vec![TrieReport {
                name: "default".to_string(),
                admitted: 950,
                drops: [50, 0, 0, 0, 0, 0, 0, 0],
                recipes: vec![RecipeReport {
                    recipe,
                    matches: vec![CidrMatch {
                        cidr: "10.0.0.0/24".parse().unwrap(),
                        count: 612,
                        percentage: 0.644,
                    }],
                }],
            }],
            active_bans: vec!["10.0.0.0/24".parse().unwrap()],
            parsed: 1000,
            malformed: 3,
        }
    }

    #[test]
    fn plain_output_shape() {
        let text = render_plain(&report());
        assert!(text.contains("1000 requests parsed, 3 malformed"));
        assert!(text.contains("trie 'default': 950 requests admitted"));
        assert!(text.contains("dropped: ip_whitelist=50"));
        assert!(text.contains("10.0.0.0/24"));
        assert!(text.contains("612"));
        assert!(text.contains("64.40%"));
        assert!(text.contains("active bans (1)"));
    }

    #[test]
    fn compact_output_shape() {
        let text = render_compact(&report());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "default\t100,8,32,0.10\t10.0.0.0/24\t612\t0.6440");
        assert_eq!(lines[1], "ban\t10.0.0.0/24");
    }

    #[test]
    fn empty_matches_render_placeholder() {
        let mut r = report();
        r.tries[0].recipes[0].matches.clear();
        let text = render_plain(&r);
        assert!(text.contains("no ranges detected"));
    }
}
