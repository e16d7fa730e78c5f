mod cli;
mod gateway;

fn main() {
    std::process::exit(cli::run());
}
