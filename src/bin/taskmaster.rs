use clap::Parser;

fn main() {
    let args = taskmaster::tm::cli::Args::parse();
    std::process::exit(taskmaster::tm::run(args));
}
