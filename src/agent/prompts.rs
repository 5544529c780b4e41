//! # Prompt Composer
//!
//! System prompts are assembled from ordered layers rather than one blob:
//!
//! 1. Role & identity
//! 2. Critical protocols (file-creation override)
//! 3. Task definition (route-specific)
//! 4. Format rules (context-aware)
//! 5. User customization
//!
//! The current date is injected into the task layer so models stop insisting
//! it is their training cutoff year.

use chrono::Utc;

use crate::router::{RouteConfig, RouteKind};

pub struct PromptComposer;

impl PromptComposer {
    pub fn new() -> Self {
        Self
    }

    /// Compose the full system prompt for a routed request.
    pub fn compose(&self, route_config: &RouteConfig, user_base_prompt: Option<&str>) -> String {
        let current_date = Utc::now().format("%Y-%m-%d").to_string();
        let mut layers = vec![self.role_layer().to_string()];

        if route_config.wants_output_artifact() {
            layers.push(self.file_creation_protocol().to_string());
        }

        layers.push(self.task_layer(route_config.route, &current_date));
        layers.push(
            self.format_layer(route_config.wants_output_artifact())
                .to_string(),
        );

        if let Some(base_prompt) = user_base_prompt {
            if !base_prompt.trim().is_empty() {
                layers.push(base_prompt.trim().to_string());
            }
        }

        layers.join("\n\n")
    }

    fn role_layer(&self) -> &'static str {
        "You are a helpful chat assistant. You chat naturally with users, provide information, \
         help with code, and conduct research when needed.\n\
         Your primary role is conversational - you are CHATTING with users, not writing files \
         or generating raw output."
    }

    /// Protocol override for turns whose answer becomes a file: the model
    /// must still chat, never render the response as file content.
    fn file_creation_protocol(&self) -> &'static str {
        "YOU ARE CHATTING - NEVER FORMAT YOUR RESPONSE AS A FILE\n\
         \n\
         Do NOT write phrases like \"Here's the markdown content for your file:\" and do NOT \
         wrap the entire response in a code block. Respond conversationally; the system \
         extracts file content automatically.\n\
         \n\
         WRONG: \"Here's the markdown content:\\n```markdown\\n# Analysis\\n```\"\n\
         RIGHT: \"Here's my analysis: **Analysis** - ...\""
    }

    fn task_layer(&self, route: RouteKind, current_date: &str) -> String {
        match route {
            RouteKind::Reasoning => format!(
                "Date: {current_date}\n\n\
                 TASK: Analytical reasoning, comparisons, trade-off analysis.\n\n\
                 APPROACH:\n\
                 1. For current/factual questions: use web_search then fetch_webpage (2-3 sources max)\n\
                 2. For conceptual questions: use your knowledge base\n\
                 3. Synthesize information from multiple perspectives\n\
                 4. Present evidence-based analysis with clear recommendations\n\n\
                 SOURCE CITATION (when using web tools):\n\
                 - Cite sources inline by name, never bracket citations like [1]\n\
                 - List sources at the end as [Source Title](url)"
            ),
            RouteKind::SimpleCode => format!(
                "Date: {current_date}\n\n\
                 TASK: Code generation, debugging, explanations.\n\n\
                 APPROACH:\n\
                 - Write clean, working code with brief explanations\n\
                 - Include error handling where appropriate\n\
                 - Provide usage examples when helpful"
            ),
            RouteKind::Research => format!(
                "Date: {current_date}\n\n\
                 TASK: Deep research requiring 4-5 web sources.\n\n\
                 APPROACH:\n\
                 1. Use web_search to find relevant sources\n\
                 2. Use fetch_webpage to retrieve content\n\
                 3. Cross-reference information and note conflicts\n\
                 4. Synthesize a comprehensive report citing all sources\n\n\
                 SOURCE CITATION:\n\
                 - Reference sources inline by name, never bracket citations\n\
                 - List sources at the end as [Source Title](url)"
            ),
            RouteKind::Math => format!(
                "Date: {current_date}\n\n\
                 TASK: Solve mathematical problems with step-by-step working.\n\n\
                 FORMATTING:\n\
                 - Use Unicode math notation (x², ∫, √, π), never LaTeX\n\
                 - Structure: brief acknowledgment, **Step-by-Step Breakdown:** as a numbered \
                 list, then **Final Answer:**\n\n\
                 WEB SEARCH: solve from your own knowledge; only search when the user \
                 explicitly asks you to look something up."
            ),
            RouteKind::SelfHandle => format!(
                "Date: {current_date}\n\n\
                 TASK: General assistance - quick questions, conversation, light research.\n\n\
                 Keep responses clear and reasonably short."
            ),
        }
    }

    fn format_layer(&self, file_creation: bool) -> &'static str {
        if file_creation {
            "FORMAT RULES:\n\
             - Use **bold text** for headings\n\
             - Use bullet lists for comparisons/data\n\
             - Use ```language code blocks for code\n\
             - ALWAYS start with a conversational intro (\"Here's...\"), never with raw \
             content headings"
        } else {
            "FORMAT RULES:\n\
             - Use **bold text** for headings\n\
             - Use bullet lists for comparisons/data\n\
             - Use ```language code blocks for code\n\
             - No bracket citations like [1], [2]; cite by name inline"
        }
    }
}

impl Default for PromptComposer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{Postprocessing, RouteConfig};

    fn config(route: RouteKind, output_artifact: bool) -> RouteConfig {
        RouteConfig {
            route,
            model: "m".into(),
            preprocessing: Vec::new(),
            postprocessing: if output_artifact {
                vec![Postprocessing::OutputArtifact]
            } else {
                Vec::new()
            },
            filtered_prompt: None,
            user_selected: false,
        }
    }

    #[test]
    fn test_date_is_injected() {
        let composer = PromptComposer::new();
        let prompt = composer.compose(&config(RouteKind::Reasoning, false), None);
        let today = Utc::now().format("%Y-%m-%d").to_string();
        assert!(prompt.contains(&today));
    }

    #[test]
    fn test_file_creation_layer_only_for_output_artifact() {
        let composer = PromptComposer::new();
        let plain = composer.compose(&config(RouteKind::SimpleCode, false), None);
        let artifact = composer.compose(&config(RouteKind::SimpleCode, true), None);

        assert!(!plain.contains("NEVER FORMAT YOUR RESPONSE AS A FILE"));
        assert!(artifact.contains("NEVER FORMAT YOUR RESPONSE AS A FILE"));
        assert!(artifact.contains("conversational intro"));
    }

    #[test]
    fn test_routes_get_distinct_task_layers() {
        let composer = PromptComposer::new();
        let research = composer.compose(&config(RouteKind::Research, false), None);
        let math = composer.compose(&config(RouteKind::Math, false), None);

        assert!(research.contains("Deep research"));
        assert!(math.contains("Step-by-Step Breakdown"));
        assert!(!math.contains("Deep research"));
    }

    #[test]
    fn test_user_base_prompt_is_appended_last() {
        let composer = PromptComposer::new();
        let prompt = composer.compose(
            &config(RouteKind::SelfHandle, false),
            Some("Always answer in French."),
        );
        assert!(prompt.trim_end().ends_with("Always answer in French."));
    }

    #[test]
    fn test_blank_user_prompt_ignored() {
        let composer = PromptComposer::new();
        let with_blank = composer.compose(&config(RouteKind::SelfHandle, false), Some("   "));
        let without = composer.compose(&config(RouteKind::SelfHandle, false), None);
        assert_eq!(with_blank, without);
    }
}
