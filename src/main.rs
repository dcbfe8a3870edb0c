use std::process::ExitCode;

fn main() -> ExitCode {
    clinic_migrate_lib::run()
}
