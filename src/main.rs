fn main() {
    if let Err(err) = process_layout::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
