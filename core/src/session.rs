//! Session Visibility Engine: slash-command parsing, entry-point/dependent
//! classification, config-prerequisite gating, fuzzy tool resolution,
//! argument assembly, and the post-call bookkeeping that feeds all of it
//! back into the next turn's visibility decision.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::NamespacedTool;
use crate::error::{SpikeError, SpikeResult};
use crate::fleet::Fleet;
use crate::registry::AppRegistry;

/// Per-REPL-session bookkeeping (engine spec §3 `SessionState`).
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    /// tool-prefix -> identifiers observed when a create/bootstrap tool
    /// succeeded under that prefix. Append-only within a session.
    pub created: HashMap<String, Vec<String>>,
    /// parameter name (anything ending in `_id`, plus bare `id`) ->
    /// every string value ever observed under that key, most recent last.
    pub ids_by_key: HashMap<String, Vec<String>>,
    /// original (un-namespaced) tool names recognised as configuration
    /// prerequisites that have been invoked.
    pub config_tools_called: std::collections::HashSet<String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_id(&mut self, key: &str, value: String) {
        self.ids_by_key.entry(key.to_string()).or_default().push(value);
    }

    fn latest_id(&self, key: &str) -> Option<&str> {
        self.ids_by_key.get(key).and_then(|v| v.last()).map(String::as_str)
    }
}

/// Static mapping of gating tool (original name) -> tools it gates. The
/// canonical example: a project must be rooted before tests can run.
pub fn config_prerequisites() -> HashMap<&'static str, &'static [&'static str]> {
    let mut map = HashMap::new();
    map.insert(
        "set_project_root",
        &["run_tests", "list_tests", "analyze_coverage"][..],
    );
    map
}

/// Strips the owning server prefix (if any), then returns everything before
/// the first `_`. A wire name with no underscore after the prefix keeps its
/// own (post-strip) name unchanged — see the open question on prefix
/// extraction overlapping with the no-namespace case.
pub fn extract_prefix(wire_name: &str, server: &str, sep: &str) -> String {
    let stripped = crate::namespace::strip(wire_name, server, sep);
    match stripped.split_once('_') {
        Some((prefix, _)) => prefix.to_string(),
        None => stripped.to_string(),
    }
}

const ENTRY_POINT_MARKERS: &[&str] = &["create", "list", "search", "get_status", "bootstrap"];

pub fn is_entry_point(tool: &NamespacedTool) -> bool {
    let lower = tool.namespaced_name.to_ascii_lowercase();
    if ENTRY_POINT_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    tool.descriptor.required_params().is_empty()
}

pub fn is_dependent(tool: &NamespacedTool) -> bool {
    tool.descriptor
        .required_params()
        .iter()
        .any(|p| p.ends_with("_id"))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// The enhanced visibility algorithm (§4.J), evaluated per tool against the
/// current session state.
pub fn visibility(tool: &NamespacedTool, state: &SessionState) -> Visibility {
    let prerequisites = config_prerequisites();
    for (gate, gated) in &prerequisites {
        if gated.contains(&tool.descriptor.name.as_str())
            && !state.config_tools_called.contains(*gate)
        {
            return Visibility::Hidden;
        }
    }

    if is_entry_point(tool) {
        return Visibility::Visible;
    }

    if is_dependent(tool) {
        let required_ids = tool.descriptor.required_params();
        let required_ids: Vec<&String> = required_ids.iter().filter(|p| p.ends_with("_id")).collect();
        let all_seen = required_ids
            .iter()
            .all(|p| state.ids_by_key.contains_key(p.as_str()));
        if all_seen {
            return Visibility::Visible;
        }
        let prefix = extract_prefix(&tool.namespaced_name, &tool.server, "__");
        if state.created.contains_key(&prefix) {
            return Visibility::Visible;
        }
        return Visibility::Hidden;
    }

    Visibility::Visible
}

/// One entry in a display group: the tool plus whether it's immediately
/// callable with no arguments.
#[derive(Debug, Clone)]
pub struct GroupedTool {
    pub tool: NamespacedTool,
    pub ready: bool,
}

#[derive(Debug, Clone)]
pub struct ToolGroup {
    pub label: String,
    pub tools: Vec<GroupedTool>,
    pub hidden_count: usize,
}

/// Groups tools for display: by App when the registry has entries, else by
/// prefix. Only visible tools appear in a group's list; `hidden_count`
/// reports how many sibling tools in the same group were hidden.
pub fn group_for_display(
    tools: &[NamespacedTool],
    state: &SessionState,
    registry: &AppRegistry,
) -> Vec<ToolGroup> {
    let mut groups: HashMap<String, (Vec<GroupedTool>, usize)> = HashMap::new();

    for tool in tools {
        let label = if !registry.is_empty() {
            registry
                .by_tool_name(&tool.descriptor.name)
                .or_else(|| {
                    let stripped = crate::namespace::strip(&tool.namespaced_name, &tool.server, "__");
                    registry.by_tool_name(stripped)
                })
                .map(|app| app.name)
                .unwrap_or_else(|| tool.server.clone())
        } else {
            extract_prefix(&tool.namespaced_name, &tool.server, "__")
        };

        let entry = groups.entry(label).or_insert_with(|| (Vec::new(), 0));
        match visibility(tool, state) {
            Visibility::Visible => entry.0.push(GroupedTool {
                ready: tool.descriptor.required_params().is_empty(),
                tool: tool.clone(),
            }),
            Visibility::Hidden => entry.1 += 1,
        }
    }

    let mut result: Vec<ToolGroup> = groups
        .into_iter()
        .map(|(label, (tools, hidden_count))| ToolGroup {
            label,
            tools,
            hidden_count,
        })
        .collect();
    result.sort_by(|a, b| a.label.cmp(&b.label));
    result
}

/// A slash command split into its verb and raw (trimmed) argument string.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedInput {
    Command { name: String, argument: String },
    DirectToolCall { query: String, argument: String },
}

const BUILTIN_COMMANDS: &[&str] = &[
    "tools", "apps", "servers", "clear", "model", "help", "quit", "exit",
];

pub fn parse_input(input: &str) -> ParsedInput {
    let rest = input.strip_prefix('/').unwrap_or(input);
    let (first, remainder) = match rest.split_once(' ') {
        Some((f, r)) => (f.to_string(), r.trim().to_string()),
        None => (rest.to_string(), String::new()),
    };

    if input.starts_with('/') && BUILTIN_COMMANDS.contains(&first.as_str()) {
        ParsedInput::Command {
            name: first,
            argument: remainder,
        }
    } else if input.starts_with('/') {
        ParsedInput::DirectToolCall {
            query: first,
            argument: remainder,
        }
    } else {
        ParsedInput::DirectToolCall {
            query: first,
            argument: remainder,
        }
    }
}

/// Fuzzy subsequence score. Higher is a better match; `0.0` means `query`
/// doesn't occur as a subsequence of `candidate` at all.
pub fn fuzzy_score(query: &str, candidate: &str) -> f64 {
    let q: Vec<char> = query.to_ascii_lowercase().chars().collect();
    let original: Vec<char> = candidate.chars().collect();
    let lower: Vec<char> = candidate.to_ascii_lowercase().chars().collect();

    if q.is_empty() {
        return 0.0;
    }

    let mut score = 0.0;
    let mut qi = 0;
    let mut last_match: Option<usize> = None;

    for (pos, &c) in lower.iter().enumerate() {
        if qi >= q.len() {
            break;
        }
        if c != q[qi] {
            continue;
        }

        score += 1.0;

        let at_boundary = pos == 0
            || matches!(original.get(pos.wrapping_sub(1)), Some('_') | Some('-'))
            || (pos > 0
                && original[pos - 1].is_ascii_lowercase()
                && original[pos].is_ascii_uppercase());
        if at_boundary {
            score += 2.0;
        }

        if let Some(last) = last_match {
            if pos == last + 1 {
                score += 3.0;
            } else {
                score -= 0.5 * (pos - last - 1) as f64;
            }
        }

        if qi == 0 && pos == 0 {
            score += 5.0;
        }

        last_match = Some(pos);
        qi += 1;
    }

    if qi < q.len() {
        return 0.0;
    }
    score.max(0.0)
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub tool: NamespacedTool,
    pub ambiguous: bool,
}

/// Resolves a user-typed query against the catalog: exact namespaced, exact
/// original, exact stripped, then fuzzy with a 2x disambiguation margin.
pub fn resolve_tool(query: &str, tools: &[NamespacedTool]) -> Option<Resolution> {
    if let Some(tool) = tools.iter().find(|t| t.namespaced_name == query) {
        return Some(Resolution {
            tool: tool.clone(),
            ambiguous: false,
        });
    }
    if let Some(tool) = tools.iter().find(|t| t.descriptor.name == query) {
        return Some(Resolution {
            tool: tool.clone(),
            ambiguous: false,
        });
    }
    if let Some(tool) = tools
        .iter()
        .find(|t| crate::namespace::strip(&t.namespaced_name, &t.server, "__") == query)
    {
        return Some(Resolution {
            tool: tool.clone(),
            ambiguous: false,
        });
    }

    let mut scored: Vec<(f64, &NamespacedTool)> = tools
        .iter()
        .map(|t| (fuzzy_score(query, &t.namespaced_name), t))
        .filter(|(score, _)| *score > 0.0)
        .collect();
    if scored.is_empty() {
        return None;
    }
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    if scored.len() == 1 {
        return Some(Resolution {
            tool: scored[0].1.clone(),
            ambiguous: false,
        });
    }

    let (best_score, best_tool) = scored[0];
    let (runner_up_score, _) = scored[1];
    let ambiguous = !(runner_up_score == 0.0 || best_score >= 2.0 * runner_up_score);

    Some(Resolution {
        tool: best_tool.clone(),
        ambiguous,
    })
}

/// Anything that can answer "what value did the user type for this
/// parameter", used by argument assembly's interactive fallback. A headless
/// caller supplies [`NoPrompt`].
pub trait ParamPrompt {
    fn ask(&self, param_name: &str) -> Option<String>;
}

pub struct NoPrompt;
impl ParamPrompt for NoPrompt {
    fn ask(&self, _param_name: &str) -> Option<String> {
        None
    }
}

fn coerce(raw: &str, param_type: Option<&str>) -> serde_json::Value {
    match param_type {
        Some("number") => serde_json::Number::from_f64(raw.parse().unwrap_or(0.0))
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::String(raw.to_string())),
        Some("integer") => raw
            .parse::<i64>()
            .map(|n| serde_json::Value::Number(n.into()))
            .unwrap_or(serde_json::Value::String(raw.to_string())),
        Some("boolean") => serde_json::Value::Bool(raw == "true" || raw == "1"),
        Some("array") | Some("object") => {
            serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
        }
        _ => serde_json::Value::String(raw.to_string()),
    }
}

/// Builds the final argument mapping for a resolved tool call, per the
/// five-step assembly algorithm. Returns `None` (aborting the call) if a
/// required parameter is still missing after prompting and the prompt
/// returned an empty answer.
pub fn assemble_arguments(
    tool: &NamespacedTool,
    raw_argument: &str,
    state: &SessionState,
    prompt: &dyn ParamPrompt,
) -> SpikeResult<serde_json::Map<String, serde_json::Value>> {
    let mut merged = tool.descriptor.property_defaults();

    if !raw_argument.trim().is_empty() {
        let user_args: serde_json::Value = serde_json::from_str(raw_argument)
            .map_err(|e| SpikeError::InvalidJsonArgs(e.to_string()))?;
        if let serde_json::Value::Object(map) = user_args {
            for (k, v) in map {
                merged.insert(k, v);
            }
        }
    }

    for required in tool.descriptor.required_params() {
        if merged.contains_key(&required) {
            continue;
        }
        if required.ends_with("_id") || required == "id" {
            if let Some(value) = state.latest_id(&required) {
                merged.insert(required.clone(), serde_json::Value::String(value.to_string()));
                continue;
            }
        }
        if let Some(answer) = prompt.ask(&required) {
            if answer.is_empty() {
                return Err(SpikeError::MissingRequiredParam(required));
            }
            let coerced = coerce(&answer, tool.descriptor.property_type(&required));
            merged.insert(required, coerced);
        } else {
            return Err(SpikeError::MissingRequiredParam(required));
        }
    }

    Ok(merged)
}

const IDENTIFIER_KEYS: &[&str] = &["id", "game_id", "player_id", "app_id", "session_id"];

/// Updates `SessionState` after a successful call: observes any `_id`/`id`
/// values in the result, marks configuration prerequisites called, and
/// records create/bootstrap identifiers under the tool's prefix.
pub fn record_success(state: &mut SessionState, tool: &NamespacedTool, result_text: &str) {
    let parsed: Option<serde_json::Value> = serde_json::from_str(result_text).ok();

    if let Some(serde_json::Value::Object(map)) = &parsed {
        for (key, value) in map {
            if key.ends_with("_id") || key == "id" {
                if let serde_json::Value::String(s) = value {
                    state.record_id(key, s.clone());
                }
            }
        }
    }

    if config_prerequisites().contains_key(tool.descriptor.name.as_str()) {
        state.config_tools_called.insert(tool.descriptor.name.clone());
    }

    let lower = tool.namespaced_name.to_ascii_lowercase();
    if lower.contains("create") || lower.contains("bootstrap") {
        let prefix = extract_prefix(&tool.namespaced_name, &tool.server, "__");
        let mut found = Vec::new();
        if let Some(serde_json::Value::Object(map)) = &parsed {
            for key in IDENTIFIER_KEYS {
                if let Some(serde_json::Value::String(s)) = map.get(*key) {
                    found.push(s.clone());
                }
            }
        }
        if found.is_empty() {
            found.push("_created".to_string());
        }
        state.created.entry(prefix).or_default().extend(found);
    }
}

/// Ties resolution, assembly, dispatch and bookkeeping together for one
/// direct tool invocation typed at the REPL.
pub async fn invoke(
    fleet: &Arc<Fleet>,
    state: &mut SessionState,
    query: &str,
    raw_argument: &str,
    prompt: &dyn ParamPrompt,
) -> SpikeResult<String> {
    let catalog = fleet.get_all_tools().await;
    let resolution = resolve_tool(query, &catalog)
        .ok_or_else(|| SpikeError::ToolNotFound(query.to_string()))?;

    let arguments = assemble_arguments(&resolution.tool, raw_argument, state, prompt)?;
    let result = fleet.call_tool(&resolution.tool.namespaced_name, arguments).await?;
    let text = crate::upstream::call_result_text(&result);

    if !result.is_error.unwrap_or(false) {
        record_success(state, &resolution.tool, &text);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolDescriptor;

    fn tool(server: &str, name: &str, schema: serde_json::Value) -> NamespacedTool {
        NamespacedTool::new(server, ToolDescriptor::new(name, None, schema), "__")
    }

    #[test]
    fn prefix_extraction_strips_server_then_splits_on_underscore() {
        assert_eq!(extract_prefix("chess__chess_create_game", "chess", "__"), "chess");
    }

    #[test]
    fn prefix_extraction_keeps_whole_name_without_underscore() {
        assert_eq!(extract_prefix("chess__status", "chess", "__"), "status");
    }

    #[test]
    fn tool_with_no_required_params_is_an_entry_point() {
        let t = tool("srv", "do_thing", serde_json::json!({"type": "object"}));
        assert!(is_entry_point(&t));
    }

    #[test]
    fn tool_named_create_is_an_entry_point_even_with_required_params() {
        let t = tool(
            "srv",
            "create_game",
            serde_json::json!({"type": "object", "required": ["mode"]}),
        );
        assert!(is_entry_point(&t));
    }

    #[test]
    fn dependent_tool_requires_an_id_parameter() {
        let t = tool(
            "srv",
            "make_move",
            serde_json::json!({"type": "object", "required": ["game_id", "move"]}),
        );
        assert!(is_dependent(&t));
    }

    #[test]
    fn dependent_tool_hidden_until_id_observed_or_prefix_created() {
        let t = tool(
            "chess",
            "chess_make_move",
            serde_json::json!({"type": "object", "required": ["game_id"]}),
        );
        let mut state = SessionState::new();
        assert_eq!(visibility(&t, &state), Visibility::Hidden);

        state.created.insert("chess".to_string(), vec!["_created".to_string()]);
        assert_eq!(visibility(&t, &state), Visibility::Visible);
    }

    #[test]
    fn dependent_tool_visible_once_its_id_key_is_known() {
        let t = tool(
            "chess",
            "chess_make_move",
            serde_json::json!({"type": "object", "required": ["game_id"]}),
        );
        let mut state = SessionState::new();
        state.record_id("game_id", "g1".to_string());
        assert_eq!(visibility(&t, &state), Visibility::Visible);
    }

    #[test]
    fn gated_tool_hidden_until_prerequisite_called() {
        let t = tool("proj", "run_tests", serde_json::json!({"type": "object"}));
        let mut state = SessionState::new();
        assert_eq!(visibility(&t, &state), Visibility::Hidden);
        state.config_tools_called.insert("set_project_root".to_string());
        assert_eq!(visibility(&t, &state), Visibility::Visible);
    }

    #[test]
    fn slash_command_parses_verb_and_argument() {
        assert_eq!(
            parse_input("/tools github"),
            ParsedInput::Command {
                name: "tools".to_string(),
                argument: "github".to_string(),
            }
        );
    }

    #[test]
    fn unrecognised_slash_word_is_a_direct_tool_call() {
        assert_eq!(
            parse_input("/github__create_issue {\"title\":\"x\"}"),
            ParsedInput::DirectToolCall {
                query: "github__create_issue".to_string(),
                argument: "{\"title\":\"x\"}".to_string(),
            }
        );
    }

    #[test]
    fn fuzzy_score_rewards_prefix_and_consecutive_matches() {
        let exact_prefix = fuzzy_score("cre", "create_issue");
        let scattered = fuzzy_score("cre", "cancel_review_entry");
        assert!(exact_prefix > scattered);
    }

    #[test]
    fn fuzzy_score_is_zero_when_query_is_not_a_subsequence() {
        assert_eq!(fuzzy_score("xyz", "create_issue"), 0.0);
    }

    #[test]
    fn resolve_prefers_exact_namespaced_match() {
        let tools = vec![
            tool("github", "create_issue", serde_json::json!({"type": "object"})),
            tool("gitlab", "create_issue", serde_json::json!({"type": "object"})),
        ];
        let resolution = resolve_tool("github__create_issue", &tools).unwrap();
        assert_eq!(resolution.tool.server, "github");
        assert!(!resolution.ambiguous);
    }

    #[test]
    fn resolve_falls_back_to_fuzzy_when_no_exact_match_exists() {
        let tools = vec![
            tool("github", "create_issue", serde_json::json!({"type": "object"})),
            tool("gitlab", "close_ticket", serde_json::json!({"type": "object"})),
        ];
        let resolution = resolve_tool("create_iss", &tools).unwrap();
        assert_eq!(resolution.tool.descriptor.name, "create_issue");
    }

    #[test]
    fn argument_assembly_overlays_user_args_on_schema_defaults() {
        let t = tool(
            "srv",
            "do_thing",
            serde_json::json!({
                "type": "object",
                "properties": {"mode": {"type": "string", "default": "fast"}}
            }),
        );
        let state = SessionState::new();
        let args = assemble_arguments(&t, "{\"mode\": \"slow\"}", &state, &NoPrompt).unwrap();
        assert_eq!(args.get("mode"), Some(&serde_json::json!("slow")));
    }

    #[test]
    fn argument_assembly_backfills_required_id_from_session_state() {
        let t = tool(
            "chess",
            "chess_make_move",
            serde_json::json!({"type": "object", "required": ["game_id"]}),
        );
        let mut state = SessionState::new();
        state.record_id("game_id", "g42".to_string());
        let args = assemble_arguments(&t, "", &state, &NoPrompt).unwrap();
        assert_eq!(args.get("game_id"), Some(&serde_json::json!("g42")));
    }

    #[test]
    fn argument_assembly_fails_closed_without_a_prompt_channel() {
        let t = tool(
            "chess",
            "chess_make_move",
            serde_json::json!({"type": "object", "required": ["game_id"]}),
        );
        let state = SessionState::new();
        let result = assemble_arguments(&t, "", &state, &NoPrompt);
        assert!(matches!(result, Err(SpikeError::MissingRequiredParam(_))));
    }

    #[test]
    fn record_success_captures_ids_and_create_bookkeeping() {
        let t = tool(
            "chess",
            "chess_create_game",
            serde_json::json!({"type": "object"}),
        );
        let mut state = SessionState::new();
        record_success(&mut state, &t, r#"{"game_id": "g1"}"#);
        assert_eq!(state.ids_by_key.get("game_id"), Some(&vec!["g1".to_string()]));
        assert_eq!(state.created.get("chess"), Some(&vec!["g1".to_string()]));
    }

    #[test]
    fn record_success_uses_created_sentinel_when_no_identifier_present() {
        let t = tool("chess", "chess_bootstrap", serde_json::json!({"type": "object"}));
        let mut state = SessionState::new();
        record_success(&mut state, &t, "{}");
        assert_eq!(state.created.get("chess"), Some(&vec!["_created".to_string()]));
    }
}
