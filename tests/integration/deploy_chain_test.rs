//! S6 (spec §8): a deploy chain `combine -> postdeploy:[write]` concatenates
//! removed source targets into one combined product, then the chained
//! `write` plugin persists it to the deploy path.

use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::Mutex as AsyncMutex;

use kiln::kernel::{self, KernelOptions, RunKind, RunOutcome};
use kiln::tree::path_tree::PathTree;
use kiln::tree::Tree;

#[tokio::test]
async fn combine_then_write_chain_produces_single_bundle() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();

    std::fs::create_dir_all(src.path().join("src")).unwrap();
    std::fs::write(src.path().join("src/a.js"), b"A").unwrap();
    std::fs::write(src.path().join("src/b.js"), b"B").unwrap();
    std::fs::write(
        src.path().join("kiln.config.json"),
        r#"{
            "build": "write",
            "deploy": {
                "id": "combine",
                "output": "bundle.js",
                "ordering": ["src/a.js", "src/b.js"],
                "chain": { "postdeploy": [ { "id": "write" } ] }
            },
            "includes": [
                { "pattern": "^src/.*\\.js$", "handlers": ["pass"] }
            ]
        }"#,
    )
    .unwrap();

    let tree: Arc<AsyncMutex<dyn Tree>> = Arc::new(AsyncMutex::new(PathTree::new(src.path().to_path_buf())));
    let options = KernelOptions {
        kind: RunKind::Deploy,
        dev: false,
        force: false,
        deploy_path: out.path().to_path_buf(),
        plugin_dirs: Vec::new(),
        on_new_target: None,
    };

    let outcome = kernel::run(tree, options).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Deployed { output_target_count: 2 }));

    let bundle = std::fs::read(out.path().join("bundle.js")).unwrap();
    assert_eq!(bundle, b"AB");
    // `combine` removed both original source targets from the output set;
    // only the synthesized bundle should have been written.
    assert!(!out.path().join("src/a.js").exists());
    assert!(!out.path().join("src/b.js").exists());
}
