mod common;

use anyhow::Result;
use cairn_context::{CharRatioEstimator, TokenEstimator};
use cairn_retriever::config::RetrievalConfig;
use cairn_retriever::rag::{ContextAssembler, ContextFormat, ContextOptions};
use common::*;
use std::sync::Arc;
use tempfile::tempdir;

#[tokio::test]
async fn test_unmatched_query_yields_empty_context() -> Result<()> {
    let dir = tempdir()?;
    let root = std::fs::canonicalize(dir.path())?;
    write(&root, "a.md", "gardening tomatoes compost");

    let (manager, _) = start(&root, test_config(), Arc::new(TestProvider::new(DIMENSION))).await?;
    let assembler = ContextAssembler::new(manager.clone(), &RetrievalConfig::default());
    let options = ContextOptions::default().with_min_score(0.99);

    let context = assembler
        .get_context("quantum chromodynamics", &options)
        .await
        .expect("retrieval is available");
    assert!(context.chunks.is_empty());
    assert_eq!(context.context_text, "");
    assert_eq!(context.stats.chunks_found, 1);
    assert_eq!(context.stats.chunks_used, 0);
    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_context_respects_token_budget() -> Result<()> {
    let dir = tempdir()?;
    let root = std::fs::canonicalize(dir.path())?;
    for i in 0..6 {
        write(
            &root,
            &format!("doc{i}.md"),
            &fixed_lines(4, 100, "parser"),
        );
    }

    let config = test_config().with_chunking(200, 20);
    let (manager, _) = start(&root, config, Arc::new(TestProvider::new(DIMENSION))).await?;
    let assembler = ContextAssembler::new(manager.clone(), &RetrievalConfig::default());
    let options = ContextOptions::default()
        .with_k(20)
        .with_min_score(0.0)
        .with_max_tokens(120);

    let context = assembler
        .get_context("parser", &options)
        .await
        .expect("retrieval is available");
    assert!(context.stats.chunks_found > context.stats.chunks_used);
    assert!(context.stats.chunks_used > 0);
    assert!(context.stats.total_tokens <= 120);

    let estimator = CharRatioEstimator::default();
    let spent: usize = context.chunks.iter().map(|c| estimator.estimate(&c.text)).sum();
    assert_eq!(spent, context.stats.total_tokens);
    for pair in context.chunks.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    for file in &context.stats.files_included {
        assert!(context.context_text.contains(&format!("## {file}")));
    }
    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_code_only_layout() -> Result<()> {
    let dir = tempdir()?;
    let root = std::fs::canonicalize(dir.path())?;
    write(&root, "src/lib.rs", "fn tokenize(input: &str) {}");

    let (manager, _) = start(&root, test_config(), Arc::new(TestProvider::new(DIMENSION))).await?;
    let assembler = ContextAssembler::new(manager.clone(), &RetrievalConfig::default());
    let options = ContextOptions::default()
        .with_min_score(0.0)
        .with_format(ContextFormat::CodeOnly);

    let context = assembler
        .get_context("tokenize input", &options)
        .await
        .expect("retrieval is available");
    assert_eq!(
        context.context_text,
        "```rust\nfn tokenize(input: &str) {}\n```"
    );
    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_disabled_index_gives_no_context() -> Result<()> {
    let dir = tempdir()?;
    let root = std::fs::canonicalize(dir.path())?;
    write(&root, "a.md", "some content");

    let (manager, _) = start(&root, test_config(), Arc::new(TestProvider::new(DIMENSION))).await?;
    manager.set_enabled(false);
    let assembler = ContextAssembler::new(manager.clone(), &RetrievalConfig::default());
    assert!(
        assembler
            .get_context("some content", &ContextOptions::default())
            .await
            .is_none()
    );
    manager.shutdown().await;
    Ok(())
}
