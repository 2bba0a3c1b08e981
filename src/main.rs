fn main() -> std::process::ExitCode {
    ctxarc::run()
}
