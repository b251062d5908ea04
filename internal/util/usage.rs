const USAGE: &str = "\
PS3 - S3-compatible storage server for development and testing

USAGE:
    ps3 [OPTIONS]

OPTIONS:
    -h, --help       Print this help message and exit
    -v, --version    Print version and exit

ENVIRONMENT VARIABLES (defaults shown):
    PS3_STORAGE_BACKEND    Storage backend: \"filesystem\" or \"memory\"  [filesystem]
    PS3_STORAGE_ROOT       Root directory for the filesystem backend   [./.s3]
    PS3_SANDBOX_MODE       Memory sandbox mode: off | auto | manual    [off]
    PS3_S3_LISTEN          S3 API listen address                       [0.0.0.0:9000]
    PS3_METRICS_LISTEN     Prometheus metrics listen address           [0.0.0.0:9100]
    PS3_LOG_LEVEL          Log level                                   [info]
";

pub fn handle_cli_flags(version: &str) -> bool {
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-h" | "--help" => {
                print!("{USAGE}");
                return true;
            }
            "-v" | "--version" => {
                println!("ps3 {version}");
                return true;
            }
            _ => {}
        }
    }
    false
}
