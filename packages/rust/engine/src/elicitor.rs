//! Bill-of-materials elicitation.
//!
//! Asks the oracle for a node's direct components over a bounded chat loop,
//! verifies the compiled list with an independent second pass, and persists
//! the survivors as child nodes in one transactional batch.

use std::collections::BTreeMap;

use carbonbom_shared::{BomItem, EngineConfig, Node, NodeStatus, ProgressFlag, Result};
use carbonbom_store::NodeStore;
use carbonbom_oracle::{ChatMessage, ElicitRequest, Oracle, parser};
use tracing::{debug, info, instrument, warn};

use crate::EngineProgress;

/// Fixed follow-up prompt for incomplete listings.
const FOLLOW_UP_PROMPT: &str = "Continue the bill of materials from where you stopped. \
     Keep the same numbering, do not repeat items you already listed, and end with DONE \
     when the list is complete.";

/// Elicit the direct components of `parent`, verify them, and persist them
/// as tier `parent.tier + 1` children. Returns the created children.
///
/// Any oracle or parse failure before the batch insert leaves the tree
/// untouched: zero children are created on error.
#[instrument(skip_all, fields(node_id = %parent.id, tier = parent.tier))]
pub async fn elicit_children(
    store: &NodeStore,
    oracle: &dyn Oracle,
    config: &EngineConfig,
    parent: &Node,
    progress: &dyn EngineProgress,
) -> Result<Vec<Node>> {
    let peers: Vec<Node> = store
        .nodes_at_tier(parent.tree_id, parent.tier)
        .await?
        .into_iter()
        .filter(|n| n.id != parent.id)
        .collect();

    progress.phase("Eliciting bill of materials");
    let (items, transcript) = run_chat_loop(
        oracle,
        &config.primary_model,
        build_bom_prompt(parent, &peers),
        config.max_follow_ups,
        progress,
    )
    .await?;

    progress.phase("Verifying bill of materials");
    let items = verify_items(oracle, &config.primary_model, items, &transcript).await;

    let children: Vec<Node> = items
        .values()
        .filter(|item| !item.name.eq_ignore_ascii_case("n/a"))
        .map(|item| Node::child_of(parent, item))
        .collect();

    store.insert_children_batch(&children).await?;
    store
        .set_flag(parent.id, ProgressFlag::Decomposition)
        .await?;
    store.set_status(parent.id, NodeStatus::Decomposed).await?;

    info!(children = children.len(), "elicitation complete");
    Ok(children)
}

/// Build the opening prompt: the node itself, its ancestry, and its
/// already-known siblings so the oracle does not re-list them.
fn build_bom_prompt(parent: &Node, peers: &[Node]) -> String {
    let mut prompt = format!(
        "List the direct bill of materials of the following component, one tier down only.\n\
         Component: {}\n\
         Context chain: {}\n",
        parent.name, parent.chain_summary
    );
    if let (Some(mass), Some(unit)) = (parent.mass, parent.mass_unit) {
        prompt.push_str(&format!("Total mass: {mass}{}\n", unit.as_str()));
    }
    if let Some(supplier) = &parent.supplier_name {
        prompt.push_str(&format!("Made by: {supplier}\n"));
    }
    if let Some(description) = &parent.description {
        prompt.push_str(&format!("Description: {description}\n"));
    }

    if !peers.is_empty() {
        prompt.push_str("\nSibling components already known at this level (do not list these):\n");
        for peer in peers {
            let mass = peer
                .mass_grams()
                .map(|g| format!(", {g}g"))
                .unwrap_or_default();
            let supplier = peer
                .supplier_name
                .as_deref()
                .map(|s| format!(", supplied by {s}"))
                .unwrap_or_default();
            prompt.push_str(&format!("- {}{mass}{supplier}\n", peer.name));
        }
    }

    prompt.push_str(
        "\nAnswer with one numbered field group per item:\n\
         *item_N_name: <component name>\n\
         *item_N_supplier: <supplier or N/A>\n\
         *item_N_description: <one line or N/A>\n\
         *item_N_mass: <number or N/A>\n\
         *item_N_unit: <g|kg|mg|t|lb|oz or N/A>\n\
         End your reply with DONE when the list is complete, or GO_AGAIN if you \
         have more items to add.",
    );
    prompt
}

/// Run the bounded elicitation chat loop.
///
/// The loop ends when a reply carries the DONE marker and introduced no new
/// indexed items, or after `max_follow_ups` follow-up turns.
async fn run_chat_loop(
    oracle: &dyn Oracle,
    model: &str,
    initial_prompt: String,
    max_follow_ups: u32,
    progress: &dyn EngineProgress,
) -> Result<(BTreeMap<u32, BomItem>, Vec<ChatMessage>)> {
    let mut messages = vec![ChatMessage::user(initial_prompt)];
    let mut items: BTreeMap<u32, BomItem> = BTreeMap::new();
    let max_turns = max_follow_ups as usize + 1;

    for turn in 1..=max_turns {
        let reply = oracle
            .elicit(ElicitRequest {
                model: model.to_string(),
                messages: messages.clone(),
            })
            .await?;
        messages.push(ChatMessage::assistant(reply.text.clone()));

        let mut new_this_turn = 0usize;
        for item in parser::parse_bom(&reply.text)? {
            if !items.contains_key(&item.index) {
                new_this_turn += 1;
            }
            items.insert(item.index, item);
        }

        let distinct = distinct_name_count(&items);
        progress.task_progress(turn, max_turns, &format!("{distinct} distinct items"));
        debug!(turn, new_this_turn, distinct, "elicitation turn complete");

        let finished =
            parser::has_done_marker(&reply.text) && new_this_turn == 0 && !reply.is_incomplete;
        if finished {
            break;
        }
        if turn == max_turns {
            warn!(max_follow_ups, "elicitation hit the follow-up limit");
            break;
        }
        messages.push(ChatMessage::user(FOLLOW_UP_PROMPT));
    }

    Ok((items, messages))
}

fn distinct_name_count(items: &BTreeMap<u32, BomItem>) -> usize {
    let mut names: Vec<String> = items
        .values()
        .map(|i| i.name.trim().to_lowercase())
        .collect();
    names.sort();
    names.dedup();
    names.len()
}

/// Independent verification pass over the compiled list.
///
/// Corrections are keyed strictly by item index: a correction overwrites
/// the fields it mentions, a name of `N/A` deletes the item, and items the
/// verifier does not mention are kept as-is. Corrections naming an index
/// the elicitor never assigned are ignored — the verifier can remove and
/// amend items, never add them. A verifier failure degrades to the
/// unverified list.
async fn verify_items(
    oracle: &dyn Oracle,
    model: &str,
    mut items: BTreeMap<u32, BomItem>,
    transcript: &[ChatMessage],
) -> BTreeMap<u32, BomItem> {
    if items.is_empty() {
        return items;
    }

    let mut messages = transcript.to_vec();
    messages.push(ChatMessage::user(build_verification_prompt(&items)));

    let reply = match oracle
        .elicit(ElicitRequest {
            model: model.to_string(),
            messages,
        })
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, "verification call failed, keeping unverified list");
            return items;
        }
    };

    let corrections = match parser::parse_bom(&reply.text) {
        Ok(corrections) => corrections,
        Err(e) => {
            warn!(error = %e, "unparsable verification reply, keeping unverified list");
            return items;
        }
    };

    for correction in corrections {
        if correction.name.eq_ignore_ascii_case("n/a") {
            if items.remove(&correction.index).is_some() {
                debug!(index = correction.index, "verifier removed item");
            }
            continue;
        }
        match items.get_mut(&correction.index) {
            Some(item) => {
                item.name = correction.name;
                if correction.supplier.is_some() {
                    item.supplier = correction.supplier;
                }
                if correction.description.is_some() {
                    item.description = correction.description;
                }
                if correction.mass.is_some() {
                    item.mass = correction.mass;
                }
                if correction.unit.is_some() {
                    item.unit = correction.unit;
                }
            }
            None => {
                warn!(index = correction.index, "verifier referenced an unlisted index, ignoring");
            }
        }
    }

    items
}

fn build_verification_prompt(items: &BTreeMap<u32, BomItem>) -> String {
    let mut prompt = String::from(
        "Fact-check the bill of materials you produced. Here is the compiled list:\n",
    );
    for item in items.values() {
        prompt.push_str(&format!(
            "{}. {} (supplier: {})\n",
            item.index,
            item.name,
            item.supplier.as_deref().unwrap_or("N/A")
        ));
    }
    prompt.push_str(
        "\nReply ONLY with corrections, using the same *item_N_field format and the \
         same index numbers. To remove a wrong item, answer *item_N_name: N/A. \
         If the list is correct, reply DONE.",
    );
    prompt
}
