fn main() {
    let args: Vec<String> = std::env::args().collect();
    if let Err(err) = ashfall::run(&args) {
        eprintln!("ashfall: {err}");
        std::process::exit(1);
    }
}
