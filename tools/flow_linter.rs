/// Flow Linter — loads a flow graph and reports structural problems.
///
/// Usage: flow_linter <graph.ron | dir> [--strict] [--verbose]
///
/// Exits non-zero when a graph fails to load, when any lint error is found,
/// or with `--strict` when any warning is found.

use narrative_flow::schema::graph::{FlowGraph, LintIssue, Severity};
use std::path::{Path, PathBuf};
use std::process;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        println!("Usage: flow_linter <graph.ron | dir> [--strict] [--verbose]");
        process::exit(0);
    }

    let target = &args[1];
    let mut strict = false;
    let mut verbose = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--strict" => strict = true,
            "--verbose" => verbose = true,
            other => {
                eprintln!("Unknown argument: {}", other);
                process::exit(1);
            }
        }
        i += 1;
    }

    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let path = Path::new(target);
    let files = if path.is_file() {
        vec![path.to_path_buf()]
    } else if path.is_dir() {
        let mut files = Vec::new();
        collect_ron_files(path, &mut files);
        files.sort();
        files
    } else {
        eprintln!("ERROR: Path '{}' does not exist", target);
        process::exit(1);
    };

    let mut load_failures = 0;
    let mut errors = 0;
    let mut warnings = 0;

    for file in &files {
        let graph = match FlowGraph::load_from_ron(file) {
            Ok(graph) => graph,
            Err(e) => {
                eprintln!("ERROR: Failed to load {}: {}", file.display(), e);
                load_failures += 1;
                continue;
            }
        };

        println!(
            "\n=== {} ({} packages, {} objects) ===\n",
            file.display(),
            graph.packages().len(),
            graph.len()
        );

        let issues = graph.lint();
        if issues.is_empty() {
            println!("All checks passed!");
        }
        for issue in &issues {
            print_issue(&graph, issue);
            match issue.severity {
                Severity::Error => errors += 1,
                Severity::Warning => warnings += 1,
            }
        }
    }

    println!(
        "\nSummary: {} files, {} load failures, {} errors, {} warnings",
        files.len(),
        load_failures,
        errors,
        warnings
    );

    let failed = load_failures > 0 || errors > 0 || (strict && warnings > 0);
    process::exit(if failed { 1 } else { 0 });
}

fn print_issue(graph: &FlowGraph, issue: &LintIssue) {
    let label = match issue.severity {
        Severity::Error => "ERROR",
        Severity::Warning => "WARNING",
    };
    let owner = graph
        .object(issue.object)
        .map(|o| o.owner().kind.name())
        .unwrap_or("?");
    println!("{}: [{} {}] {}", label, owner, issue.object, issue.message);
}

fn collect_ron_files(dir: &Path, files: &mut Vec<PathBuf>) {
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                collect_ron_files(&path, files);
            } else if path.extension().and_then(|s| s.to_str()) == Some("ron") {
                files.push(path);
            }
        }
    }
}
