//! Drive a couple of turns against the deterministic mock provider.
//!
//! ```bash
//! RUST_LOG=debug cargo run --example mock_chat
//! ```

use std::sync::Arc;

use docullm::clients::mock::{MockClient, MockStep};
use docullm::function_registry::FunctionRegistry;
use docullm::orchestrator::{QueryOrchestrator, QueryRequest};
use docullm::tools::{register_builtins, ToolCatalogOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut registry = FunctionRegistry::new();
    register_builtins(&mut registry, &ToolCatalogOptions::default())?;

    let mock = Arc::new(MockClient::new().with_script(vec![
        MockStep::CallTool {
            name: "analyze_document_quality".to_string(),
            arguments: serde_json::json!({"content": "# Demo\n\nA tiny document."}),
        },
        MockStep::Reply("The document scores reasonably; add a usage section.".to_string()),
    ]));
    let orchestrator = QueryOrchestrator::new(mock, Arc::new(registry));

    let request = QueryRequest {
        prompt: "how good is this document?".to_string(),
        document_content: Some("# Demo\n\nA tiny document.".to_string()),
        ..QueryRequest::default()
    };

    let response = orchestrator.query(&request).await?;
    println!("assistant: {}", response.content);
    for record in &response.tool_execution_results {
        println!("tool {} -> {}", record.name, record.result);
    }
    println!(
        "usage: {} prompt + {} completion tokens across the turn",
        response.usage.prompt_tokens, response.usage.completion_tokens
    );
    Ok(())
}
