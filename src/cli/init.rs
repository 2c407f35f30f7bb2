// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Init command - create a starter pipeline

use colored::Colorize;
use miette::Result;
use std::path::Path;

use super::DEFAULT_PIPELINE;

/// Run the init command
pub async fn run(name: Option<String>, force: bool, verbose: bool) -> Result<()> {
    let project_name = name.unwrap_or_else(|| {
        std::env::current_dir()
            .ok()
            .and_then(|p| p.file_name().map(|s| s.to_string_lossy().to_string()))
            .unwrap_or_else(|| "my-app".to_string())
    });

    println!("{}", "Initializing deployflow pipeline...".bold());
    println!();

    let path = Path::new(DEFAULT_PIPELINE);
    if path.exists() && !force {
        return Err(miette::miette!(
            "{} already exists. Use --force to overwrite.",
            DEFAULT_PIPELINE
        ));
    }

    std::fs::write(path, starter_pipeline(&project_name))
        .map_err(|e| miette::miette!("Failed to write {}: {}", DEFAULT_PIPELINE, e))?;
    println!("  {} Created {}", "✓".green(), DEFAULT_PIPELINE);

    println!();
    println!("{}", "Pipeline initialized!".green().bold());
    println!();
    println!("Next steps:");
    println!(
        "  1. Edit the collaborator commands in {}",
        DEFAULT_PIPELINE.cyan()
    );
    println!("  2. Run {} to check it", "deployflow validate".cyan());
    println!(
        "  3. Run {} to preview a run",
        "deployflow run --branch develop --dry-run".cyan()
    );
    println!();

    if verbose {
        println!("{}:", "Promotion".bold());
        println!("  develop → staging");
        println!("  main    → production (approval required)");
        println!();
    }

    Ok(())
}

/// Starter pipeline: build, lint and test, scan, image, then one deploy
/// stage per environment
pub fn starter_pipeline(name: &str) -> String {
    format!(
        r#"# deployflow pipeline
version: "1"
name: "{name}"

gate:
  timeout_secs: 3600

collaborators:
  build:
    command: "make build"
  lint:
    command: "make lint"
  test:
    command: "make test"
  code-scan:
    command: "semgrep scan --error --quiet"
  image-build:
    command: 'docker build -q -t "{name}:$DEPLOYFLOW_COMMIT" . >&2 && echo "{name}:$DEPLOYFLOW_COMMIT"'
  image-scan:
    command: 'trivy image --quiet --exit-code 1 --severity CRITICAL "$DEPLOYFLOW_IMAGE"'
  kind:
    command: 'kind create cluster --name "$DEPLOYFLOW_ENVIRONMENT-${{DEPLOYFLOW_RUN_ID:0:8}}" >&2 && echo "$DEPLOYFLOW_ENVIRONMENT-${{DEPLOYFLOW_RUN_ID:0:8}}"'
    teardown: 'kind delete cluster --name "$DEPLOYFLOW_CLUSTER"'
  kubectl:
    command: 'kubectl --context "kind-$DEPLOYFLOW_CLUSTER" create deployment {name} --image "$DEPLOYFLOW_IMAGE" --replicas "$DEPLOYFLOW_REPLICAS"'
  smoke:
    command: 'printf "%s\n" $DEPLOYFLOW_ENDPOINTS | xargs -I{{}} curl -fsS -o /dev/null "http://localhost:8080{{}}"'

environments:
  - name: staging
    promotion_branch: develop
    replicas: 1
    provisioner: kind
  - name: production
    promotion_branch: main
    requires_gate: true
    replicas: 3
    provisioner: kind
    endpoints: ["/", "/health", "/api/status"]

stages:
  - name: build
    steps:
      - kind: build
        collaborator: build

  - name: lint
    depends_on: [build]
    steps:
      - kind: lint
        collaborator: lint

  - name: test
    depends_on: [build]
    steps:
      - kind: test
        collaborator: test

  - name: code-scan
    depends_on: [lint, test]
    steps:
      - kind: security_scan_code
        collaborator: code-scan
        policy: blocking
        fail_on: high

  - name: image
    depends_on: [code-scan]
    steps:
      - kind: build_image
        collaborator: image-build
        produces: image
      - kind: scan_image
        collaborator: image-scan
        policy: blocking
        fail_on: critical
        reads: [image]

  - name: deploy-staging
    depends_on: [image]
    environment: staging
    steps:
      - kind: deploy
        collaborator: kubectl
        reads: [image]
      - kind: smoke_test
        collaborator: smoke

  - name: deploy-production
    depends_on: [image]
    environment: production
    steps:
      - kind: deploy
        collaborator: kubectl
        reads: [image]
      - kind: smoke_test
        collaborator: smoke
"#,
        name = name
    )
}
