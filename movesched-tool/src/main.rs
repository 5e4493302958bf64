use std::path::PathBuf;

use clap::Parser;
use movesched::{
    checker::check_schedule, renamer::RegisterFileCache, renamer::RegisterRenamer,
    schedule_block, serialize::SerializableBlock, Direction, SchedulerOptions,
    SimpleResourceManager,
};

#[derive(Parser)]
/// Tool for testing movesched.
struct Args {
    /// Print the input block and the resulting schedule.
    #[clap(short = 'v')]
    verbose: bool,

    /// Input file containing a bincode-encoded SerializableBlock.
    input: PathBuf,

    /// Which direction to schedule in.
    #[clap(value_enum, default_value = "top-down")]
    direction: CliDirection,

    /// How many cycles back a bypass may reach. Zero disables bypassing.
    #[clap(long, default_value_t = 3)]
    bypass_distance: u32,

    /// Do not rename registers.
    #[clap(long)]
    no_rename: bool,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CliDirection {
    TopDown,
    BottomUp,
}

impl From<CliDirection> for Direction {
    fn from(cli_dir: CliDirection) -> Direction {
        match cli_dir {
            CliDirection::TopDown => Direction::TopDown,
            CliDirection::BottomUp => Direction::BottomUp,
        }
    }
}

fn main() {
    pretty_env_logger::init();
    let args = Args::parse();

    let input = std::fs::read(&args.input).expect("could not read input file");
    let block: SerializableBlock =
        bincode::deserialize(&input).expect("could not deserialize input file");

    if args.verbose {
        println!("Input block: {block}");
    }

    let options = SchedulerOptions {
        direction: args.direction.into(),
        bypass_distance: args.bypass_distance,
        rename_registers: !args.no_rename,
        verbose_log: true,
        ..SchedulerOptions::default()
    };

    let machine = block.machine();
    let mut ddg = match block.to_graph() {
        Ok(ddg) => ddg,
        Err(e) => panic!("Invalid input block: {e:#?}"),
    };
    let mut rm = SimpleResourceManager::new(machine);
    let mut cache = RegisterFileCache::new();
    let mut renamer = RegisterRenamer::new(machine, &mut cache, &ddg);
    let schedule = match schedule_block(&mut ddg, machine, &mut rm, Some(&mut renamer), &options)
    {
        Ok(schedule) => schedule,
        Err(e) => {
            panic!("Scheduling failed: {e:#?}");
        }
    };

    if args.verbose {
        println!("Schedule: {schedule}");
        println!("{:#?}", schedule.stats);
    }

    if let Err(e) = check_schedule(&ddg, machine) {
        panic!("Schedule checker failed: {e:#?}");
    }
}
