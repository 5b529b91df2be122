/// Flow Preview — interactive shell for stepping through a flow graph.
///
/// Usage: flow_preview [--graph <path>] [--start <id|name>] [--settings <path>]
///                     [--seed <n>] [--verbose]
///
/// Without `--graph` the embedded tavern demo is used.
///
/// Commands:
///   branches           — list the available branches
///   play <n>           — play branch n
///   finish <pin>       — run an output pin of the paused node now
///   cursor             — show the current node
///   vars               — list all variables
///   get <Ns.Var>       — show one variable
///   set <Ns.Var> <v>   — assign a variable (true/false, integer, or text)
///   load <package>     — load a package
///   unload <package>   — unload a package
///   restart            — return to the start node
///   help               — list commands
///   quit               — exit

use narrative_flow::core::database::Database;
use narrative_flow::core::player::{Branch, FlowPlayer, PlayerSettings};
use narrative_flow::core::script::ScriptRunner;
use narrative_flow::demo;
use narrative_flow::schema::graph::FlowGraph;
use narrative_flow::schema::ids::{FlowRef, NodeId};
use narrative_flow::schema::value::Value;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 && (args[1] == "--help" || args[1] == "-h") {
        print_usage();
        return;
    }

    let mut graph_path = None;
    let mut start = None;
    let mut settings_path = None;
    let mut seed: u64 = 42;
    let mut verbose = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--graph" if i + 1 < args.len() => {
                i += 1;
                graph_path = Some(args[i].clone());
            }
            "--start" if i + 1 < args.len() => {
                i += 1;
                start = Some(args[i].clone());
            }
            "--settings" if i + 1 < args.len() => {
                i += 1;
                settings_path = Some(args[i].clone());
            }
            "--seed" if i + 1 < args.len() => {
                i += 1;
                seed = args[i].parse().unwrap_or(42);
            }
            "--verbose" => verbose = true,
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_usage();
                process::exit(1);
            }
        }
        i += 1;
    }

    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let db = match &graph_path {
        Some(path) => load_database(path, seed),
        None => demo::tavern(seed).unwrap_or_else(|e| {
            eprintln!("ERROR: Failed to load demo graph: {}", e);
            process::exit(1);
        }),
    };
    let start = start.unwrap_or_else(|| demo::TAVERN_START.to_string());

    let settings = match &settings_path {
        Some(path) => PlayerSettings::load_from_ron(Path::new(path)).unwrap_or_else(|e| {
            eprintln!("ERROR: Failed to load settings: {}", e);
            process::exit(1);
        }),
        None => PlayerSettings::default(),
    };

    let mut player = match FlowPlayer::builder(db).settings(settings).build() {
        Ok(player) => player,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = start_at(&mut player, &start) {
        eprintln!("ERROR: {}", e);
        process::exit(1);
    }

    println!(
        "Loaded {} objects, seed {}",
        player.database().graph().len(),
        seed
    );
    println!("Type 'help' for commands.\n");
    print_cursor(&player);
    print_branches(&player);

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("flow> ");
        stdout.flush().ok();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_err() || line.is_empty() {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        let cmd = parts[0].to_lowercase();

        match cmd.as_str() {
            "quit" | "exit" | "q" => {
                println!("Goodbye.");
                break;
            }
            "help" | "h" | "?" => print_help(),
            "branches" | "b" => print_branches(&player),
            "cursor" | "c" => print_cursor(&player),
            "play" | "p" => {
                let Some(index) = parts.get(1).and_then(|s| s.parse::<usize>().ok()) else {
                    println!("Usage: play <n>");
                    continue;
                };
                match player.play(index) {
                    Ok(()) => {
                        print_cursor(&player);
                        print_branches(&player);
                    }
                    Err(e) => println!("ERROR: {}", e),
                }
            }
            "finish" => {
                let pin = parts.get(1).and_then(|s| s.parse::<usize>().ok()).unwrap_or(0);
                if player.finish_current_paused_object(pin) {
                    println!("Ran output pin {}.", pin);
                } else {
                    println!("Nothing to finish.");
                }
            }
            "vars" | "v" => {
                if let Some(vars) = player.variables() {
                    for (namespace, name, value) in vars.iter() {
                        println!("  {}.{} = {}", namespace, name, demo::describe_value(value));
                    }
                }
            }
            "get" => {
                let Some(name) = parts.get(1) else {
                    println!("Usage: get <Namespace.Variable>");
                    continue;
                };
                let (value, found) = player.variables_mut().get_by_name(name);
                if found {
                    println!("  {} = {}", name, demo::describe_value(&value));
                } else {
                    println!("Unknown variable: {}", name);
                }
            }
            "set" => {
                if parts.len() < 3 {
                    println!("Usage: set <Namespace.Variable> <value>");
                    continue;
                }
                let value = parse_value(&parts[2..].join(" "));
                if player.variables_mut().set_by_name(parts[1], value) {
                    player.update_available_branches();
                    print_branches(&player);
                } else {
                    println!("Could not set {}", parts[1]);
                }
            }
            "load" | "unload" => {
                let Some(package) = parts.get(1) else {
                    println!("Usage: {} <package>", cmd);
                    continue;
                };
                let db = player.database_mut();
                if cmd == "load" {
                    if let Err(e) = db.load_package(package) {
                        println!("ERROR: {}", e);
                    }
                } else if !db.unload_package(package) {
                    println!("Package '{}' is not loaded", package);
                }
                println!("Loaded packages: {}", player.database().loaded_packages().join(", "));
            }
            "restart" => {
                if let Err(e) = start_at(&mut player, &start) {
                    println!("ERROR: {}", e);
                }
                print_cursor(&player);
                print_branches(&player);
            }
            _ => println!("Unknown command '{}'. Type 'help' for commands.", cmd),
        }
    }
}

fn print_usage() {
    println!(
        "Usage: flow_preview [--graph <path>] [--start <id|name>] [--settings <path>] \
         [--seed <n>] [--verbose]"
    );
}

fn print_help() {
    println!("Commands:");
    println!("  branches           list the available branches");
    println!("  play <n>           play branch n");
    println!("  finish <pin>       run an output pin of the paused node now");
    println!("  cursor             show the current node");
    println!("  vars               list all variables");
    println!("  get <Ns.Var>       show one variable");
    println!("  set <Ns.Var> <v>   assign a variable");
    println!("  load <package>     load a package");
    println!("  unload <package>   unload a package");
    println!("  restart            return to the start node");
    println!("  quit               exit");
}

fn load_database(path: &str, seed: u64) -> Database {
    let graph = FlowGraph::load_from_ron(Path::new(path)).unwrap_or_else(|e| {
        eprintln!("ERROR: Failed to load graph: {}", e);
        process::exit(1);
    });
    let mut scripts = ScriptRunner::with_seed(seed);
    demo::register_tavern_scripts(&mut scripts);
    match Database::new(graph) {
        Ok(db) => db.with_scripts(scripts),
        Err(e) => {
            eprintln!("ERROR: {}", e);
            process::exit(1);
        }
    }
}

fn start_at(
    player: &mut FlowPlayer,
    start: &str,
) -> Result<(), narrative_flow::core::player::PlayerError> {
    match start.parse::<NodeId>() {
        Ok(id) => player.set_start_node(id),
        Err(_) => player.set_start_node_by_name(start),
    }
}

fn parse_value(s: &str) -> Value {
    match s {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => match s.parse::<i64>() {
            Ok(i) => Value::Int(i),
            Err(_) => Value::String(s.trim_matches('"').to_string()),
        },
    }
}

fn describe_node(player: &FlowPlayer, node: FlowRef) -> String {
    let graph = player.database().graph();
    let Some(n) = graph.node(node.id) else {
        return node.to_string();
    };
    let name = if n.technical_name.is_empty() {
        n.id.to_string()
    } else {
        n.technical_name.clone()
    };
    let speaker = n
        .speaker
        .and_then(|s| graph.node(s))
        .map(|s| format!("{}: ", s.text))
        .unwrap_or_default();
    if n.text.is_empty() {
        format!("[{}] {}", n.kind.name(), name)
    } else {
        format!("[{}] {}{}", name, speaker, n.text)
    }
}

fn print_cursor(player: &FlowPlayer) {
    match player.cursor() {
        Some(cursor) => println!("\n> {}", describe_node(player, cursor)),
        None => println!("\n> (no cursor)"),
    }
}

fn print_branches(player: &FlowPlayer) {
    let branches = player.available_branches();
    let graph = player.database().graph();
    if branches.iter().all(|b| b.flow_nodes(graph).len() <= 1) {
        println!("  (end of flow)");
        return;
    }
    for branch in branches {
        print_branch(player, branch);
    }
}

fn print_branch(player: &FlowPlayer, branch: &Branch) {
    let target = branch
        .target()
        .map(|t| describe_node(player, t))
        .unwrap_or_else(|| "(dead end)".to_string());
    let marker = if branch.is_valid { "" } else { " (invalid)" };
    println!("  {}) {}{}", branch.index.unwrap_or(0), target, marker);
}
