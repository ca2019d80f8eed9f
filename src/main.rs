use predcoder::observer::HierarchyAdapter;
use predcoder::prelude::*;
use tracing::{error, info};

struct Args {
    steps: usize,
    layers: usize,
    seed: u64,
    config: Option<String>,
    agent: bool,
}

fn main() {
    tracing_subscriber::fmt::init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    if argv
        .iter()
        .any(|a| a == "--help" || a == "-h" || a == "help")
    {
        print_help();
        return;
    }

    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            print_help();
            std::process::exit(2);
        }
    };

    let result = if args.agent {
        run_agent_demo(&args)
    } else {
        run_sequence_demo(&args)
    };
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

fn parse_args(argv: &[String]) -> std::result::Result<Args, String> {
    let mut args = Args {
        steps: 2000,
        layers: 2,
        seed: 42,
        config: None,
        agent: false,
    };

    let mut it = argv.iter();
    while let Some(arg) = it.next() {
        let mut value = |name: &str| {
            it.next()
                .cloned()
                .ok_or_else(|| format!("{name} needs a value"))
        };
        match arg.as_str() {
            "agent" => args.agent = true,
            "--steps" => {
                args.steps = value("--steps")?
                    .parse()
                    .map_err(|e| format!("--steps: {e}"))?
            }
            "--layers" => {
                args.layers = value("--layers")?
                    .parse()
                    .map_err(|e| format!("--layers: {e}"))?
            }
            "--seed" => {
                args.seed = value("--seed")?
                    .parse()
                    .map_err(|e| format!("--seed: {e}"))?
            }
            "--config" => args.config = Some(value("--config")?),
            other => return Err(format!("Unknown argument: {other}")),
        }
    }
    Ok(args)
}

fn print_help() {
    println!("predcoder (hierarchical sparse predictive coding demo)");
    println!("usage:");
    println!("  cargo run -- [--steps N] [--layers N] [--seed N] [--config file.json]");
    println!("  cargo run -- agent [--steps N] [--seed N]");
    println!("  cargo run -- --help");
}

/// Default stack: 4x4 input, 8x8 first layer, halving above.
fn default_config(layers: usize) -> HierarchyConfig {
    let mut descs = Vec::with_capacity(layers.max(1));
    let mut size = 8;
    for _ in 0..layers.max(1) {
        descs.push(LayerDesc::new(Int2::new(size, size)));
        size = (size / 2).max(2);
    }
    HierarchyConfig::new(Int2::new(4, 4), descs).with_tier(ExecutionTier::best_available())
}

fn load_config(args: &Args) -> Result<HierarchyConfig> {
    match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            HierarchyConfig::from_json_str(&text)
        }
        None => Ok(default_config(args.layers)),
    }
}

/// Diagonal position at step `t`: walk down the diagonal, then back.
fn cycle_position(size: Int2, t: usize) -> usize {
    let n = size.x.min(size.y) as usize;
    let period = (2 * n).saturating_sub(2).max(1);
    let k = t % period;
    if k < n {
        k
    } else {
        period - k
    }
}

fn cycle_input(size: Int2, t: usize) -> Grid {
    let d = cycle_position(size, t);
    let mut input = Grid::new(size);
    input.set(d, d, 1.0);
    input
}

fn run_sequence_demo(args: &Args) -> Result<()> {
    let config = load_config(args)?;
    let input_size = config.input_size;
    let mut hierarchy = Hierarchy::new(config, &mut Prng::new(args.seed))?;

    let mut window = 0.0;
    for t in 0..args.steps {
        hierarchy.step(&cycle_input(input_size, t), 0.0, true)?;
        window += hierarchy.prediction_error(0);

        if (t + 1) % 100 == 0 {
            let snap = HierarchyAdapter::new(&hierarchy).snapshot();
            let densities: Vec<String> = snap
                .diagnostics
                .layers
                .iter()
                .map(|l| format!("{:.2}", l.code_density))
                .collect();
            info!(
                step = t + 1,
                mean_error = window / 100.0,
                code_density = %densities.join("/"),
                "sequence"
            );
            window = 0.0;
        }
    }

    let snap = HierarchyAdapter::new(&hierarchy).snapshot();
    println!("{}", serde_json::to_string_pretty(&snap)?);
    Ok(())
}

fn run_agent_demo(args: &Args) -> Result<()> {
    // Reward action 0 while the input sits in the upper-left half of the
    // diagonal and action 1 otherwise.
    let config = load_config(args)?;
    let input_size = config.input_size;
    let mut rng = Prng::new(args.seed);
    let mut agent = Agent::new(config, Int2::new(2, 1), SwarmParams::default(), &mut rng)?;

    let mut reward = 0.0;
    let mut total = 0.0;
    for t in 0..args.steps {
        let input = cycle_input(input_size, t);
        agent.step(&input, reward, &mut rng, true)?;

        let half = (input_size.x.min(input_size.y) / 2) as usize;
        let wanted = if cycle_position(input_size, t) < half { 0 } else { 1 };
        let actions = agent.actions();
        reward = actions.get(wanted, 0) - actions.get(1 - wanted, 0);
        total += reward;

        if (t + 1) % 200 == 0 {
            info!(step = t + 1, mean_reward = total / 200.0, "agent");
            total = 0.0;
        }
    }
    Ok(())
}
