//! Forcing-function prompt builders. Both are pure: identical inputs give
//! byte-identical prompts.

use crate::citations::{EXTRACTION_MARKER, MISSING_DATA_MARKER};
use crate::council::debate::DebateRecord;
use crate::council::sheet::AnalysisRecord;
use crate::facts::FactMap;
use crate::personas::Persona;

const WRONG_STYLE: &str = "Based on comprehensive analysis of market dynamics, it is recommended \
that the company adopt a holistic approach and conduct further research before committing capital.";

const SYNTHESIS_SECTIONS: &[&str] = &[
    "Executive Summary",
    "Strategic Rationale",
    "Execution Plan",
    "Risk Mitigation",
    "Decision Recommendation",
];

/// First `budget` characters of `context`, marked when cut.
pub fn truncate_context(context: &str, budget: usize) -> String {
    match context.char_indices().nth(budget) {
        Some((cut, _)) => format!("{}\n[... context truncated ...]", &context[..cut]),
        None => context.to_string(),
    }
}

/// Prompt for one specialist.
pub fn specialist_prompt(
    persona: &Persona,
    query: &str,
    context: &str,
    facts: &FactMap,
    context_char_budget: usize,
) -> String {
    let mut out = String::new();

    out.push_str(&format!("You are the {}.\n\n", persona.title));
    out.push_str(&persona.identity);
    out.push_str("\n\n");
    out.push_str(&persona.reasoning_scaffold_text);
    out.push_str("\n\n");

    out.push_str(&format!("## The question from the chief executive\n{}\n\n", query.trim()));

    out.push_str("## Retrieved documents\n");
    if context.trim().is_empty() {
        out.push_str(&format!(
            "No documents were retrieved for this question. Any company-specific figure you \
             need is missing: say {} rather than guessing it.\n\n",
            MISSING_DATA_MARKER
        ));
    } else {
        out.push_str(&truncate_context(context.trim(), context_char_budget));
        out.push_str("\n\n");
    }

    out.push_str("## Extracted facts (the only company numbers you may state as fact)\n");
    if facts.is_empty() {
        out.push_str("None were extracted.\n\n");
    } else {
        for (name, fact) in facts {
            let period = fact.fiscal_period.as_deref().unwrap_or("n/a");
            out.push_str(&format!(
                "- {}: {} {} ({}) quote: \"{}\"\n",
                name, fact.value, fact.unit, period, fact.quote
            ));
        }
        out.push('\n');
    }

    out.push_str("## Instructions for this query\nThink the way you actually think. Make every one of these moves, in your own words:\n");
    for (i, step) in persona.required_moves.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, step));
    }
    out.push('\n');

    out.push_str("## Style\n");
    out.push_str(&format!("WRONG (never write like this):\n\"{}\"\n\n", WRONG_STYLE));
    out.push_str(&format!("RIGHT (this is your voice):\n\"{}\"\n\n", persona.exemplar));
    if !persona.tone_forbidden_phrases.is_empty() {
        out.push_str(&format!(
            "Never use these phrases: {}.\n",
            persona.tone_forbidden_phrases.join(", ")
        ));
    }
    if !persona.tone_required_phrases.is_empty() {
        out.push_str(&format!(
            "Phrases that sound like you: {}.\n",
            persona.tone_required_phrases.join(", ")
        ));
    }
    out.push('\n');

    out.push_str("## Citations\n");
    out.push_str(&format!(
        "Every company-specific number must carry its source: write {} \"<exact quote>\"] \
         using the quote from the extracted facts, or write {} when the datum is missing. \
         Figures from your own experience must say \"based on market knowledge\" or \
         \"based on industry benchmark\".\n",
        EXTRACTION_MARKER, MISSING_DATA_MARKER
    ));
    out
}

/// Synthesis prompt. Receives only the available analyses and the debates, never raw documents.
pub fn orchestrator_prompt(
    persona: &Persona,
    query: &str,
    analyses: &[AnalysisRecord],
    debates: &[DebateRecord],
) -> String {
    let mut out = String::new();

    out.push_str(&format!("You are the {}.\n\n", persona.title));
    out.push_str(&persona.identity);
    out.push_str("\n\n");
    out.push_str(&persona.reasoning_scaffold_text);
    out.push_str("\n\n");

    out.push_str(&format!("## The question from the chief executive\n{}\n\n", query.trim()));

    out.push_str("## Specialist analyses\n");
    for analysis in analyses.iter().filter(|a| a.available) {
        out.push_str(&format!(
            "### {} ({})\n{}\n\n",
            analysis.agent_name,
            analysis.domain,
            analysis.raw_text.trim()
        ));
    }

    out.push_str("## Contradictions between specialists\n");
    if debates.is_empty() {
        out.push_str("No direct contradiction was detected. Look for the quieter disagreements.\n\n");
    } else {
        for debate in debates {
            out.push_str(&format!("- {}\n", debate.describe()));
        }
        out.push_str("Resolve each one: find the assumption the two sides differ on and say who is right.\n\n");
    }

    out.push_str("## Your job\n");
    out.push_str("1. Find the cross-domain pattern none of the specialists saw on their own.\n");
    out.push_str("2. Surface every contradiction between them and resolve it.\n");
    out.push_str("3. Sequence the recommendations: what happens first, by when, and what it unlocks.\n");
    out.push_str("4. Quantify the main risk and name the trigger that would change the decision.\n");
    out.push_str("5. Give a definitive verdict: GO, NO-GO or CONDITIONAL. No menus.\n\n");
    out.push_str(&format!("RIGHT (this is your voice):\n\"{}\"\n\n", persona.exemplar));

    out.push_str("## Format\nWrite prose under exactly these five headings, in this order:\n");
    for section in SYNTHESIS_SECTIONS {
        out.push_str(&format!("## {}\n", section));
    }
    out.push_str(&format!(
        "\nThe first paragraph of the Executive Summary must stand alone as the answer. \
         Keep the specialists' citations; any new number needs {} \"<exact quote>\"] or {}.\n",
        EXTRACTION_MARKER, MISSING_DATA_MARKER
    ));
    out.push_str(&format!("\nNever write: {}.\n", persona.tone_forbidden_phrases.join(", ")));
    out
}
