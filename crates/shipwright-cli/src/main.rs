fn main() {
    std::process::exit(shipwright_cli::run());
}
