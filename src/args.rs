use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::{IntErrorKind, NonZeroU16},
    time::Duration,
};

use chownat_session_sm::StreamPolicy;
use thiserror::Error;

use crate::{
    relay::{BufferRetention, OverflowPolicy, ReconnectPolicy, RelayConfig, DEFAULT_RECONNECT_DELAY},
    rendezvous::RendezvousConfig,
};

pub const DEFAULT_CONTROL_PORT: u16 = 50071;
pub const DEFAULT_QUIC_PORT: u16 = 50072;
pub const DEFAULT_LISTEN_PORT: u16 = 8080;
pub const DEFAULT_LISTEN_ADDRESS: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_LISTEN_PORT);
pub const DEFAULT_RENDEZVOUS_TIMEOUT_SECS: u64 = 60;

pub fn get_version_string() -> String {
    format!(
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"), " ({} {})"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

pub fn get_help_string() -> &'static str {
    concat!(
        "Usage: chownat [options...]\n",
        "Relays one local TCP connection to a peer behind a NAT, over QUIC.\n",
        "\n",
        "Roles:\n",
        "  -s, --server                    Wait for the peer's rendezvous request and incoming connection\n",
        "  -r, --remote-address <ip>       The peer's address (required unless --server)\n",
        "\n",
        "Ports and addresses:\n",
        "  -c, --control-port <port>       UDP port for the rendezvous (default 50071)\n",
        "  -q, --quic-port <port>          UDP port for the QUIC connection (default 50072)\n",
        "  -l, --listen <address>          Local TCP address to relay (default 127.0.0.1:8080)\n",
        "      --reuse-control-socket      Run QUIC on the rendezvous socket instead of the QUIC port\n",
        "\n",
        "Relay:\n",
        "  -b, --buffer-size <bytes>       Bound of the backpressure buffer (default 1048576)\n",
        "      --chunk-size <bytes>        Most bytes read from the client at once (default 4096)\n",
        "      --max-inflight <bytes>      Pause client reads past this many unsent bytes (default 262144)\n",
        "      --overflow <policy>         drop-newest (default) or disconnect\n",
        "      --keep-buffer               Keep buffered bytes for the next client\n",
        "      --stream-policy <policy>    replace (default) or reject a concurrent relay stream\n",
        "      --open-window <ms>          How long a chunk waits for a relay stream (default 5000)\n",
        "      --reconnect <attempts>      Reconnect attempts after the connection closes (default 0)\n",
        "      --reconnect-delay <ms>      Delay before each reconnect attempt (default 1000)\n",
        "\n",
        "Rendezvous:\n",
        "      --rendezvous-timeout <s>    Give up on the rendezvous after this long, 0 waits forever (default 60)\n",
        "      --resend-interval <ms>      Resend the rendezvous request this often, 0 never (default 0)\n",
        "\n",
        "General:\n",
        "  -v, --verbose                   Print debug logs (RUST_LOG overrides this)\n",
        "  -h, --help                      Print this help and exit\n",
        "  -V, --version                   Print the version and exit\n",
    )
}

#[derive(Debug, PartialEq)]
pub enum ArgumentsRequest {
    Help,
    Version,
    Run(StartupArguments),
}

#[derive(Debug, PartialEq)]
pub struct StartupArguments {
    pub verbose: bool,
    pub is_server: bool,

    /// The peer's address. A server without one takes rendezvous requests from anywhere.
    pub remote_address: Option<IpAddr>,

    pub control_port: u16,
    pub quic_port: u16,
    pub listen_address: SocketAddr,
    pub reuse_control_socket: bool,
    pub stream_policy: StreamPolicy,
    pub rendezvous: RendezvousConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum ArgumentsError {
    #[error("Unknown argument: {0}")]
    UnknownArgument(String),

    #[error(transparent)]
    RemoteAddress(AddressErrorType),

    #[error(transparent)]
    Listen(AddressErrorType),

    #[error(transparent)]
    Port(PortErrorType),

    #[error(transparent)]
    Integer(IntegerErrorType),

    #[error(transparent)]
    Choice(ChoiceErrorType),

    #[error("You must specify the remote's address with -r/--remote-address")]
    MissingRemoteAddress,
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum AddressErrorType {
    #[error("Expected address after {0}")]
    UnexpectedEnd(String),

    #[error("Invalid address after {0}: {1}")]
    InvalidAddress(String, String),
}

fn parse_ip_address_arg(arg: String, maybe_arg2: Option<String>) -> Result<IpAddr, AddressErrorType> {
    let arg2 = match maybe_arg2 {
        Some(value) => value,
        None => return Err(AddressErrorType::UnexpectedEnd(arg)),
    };

    arg2.parse::<IpAddr>().map_err(|_| AddressErrorType::InvalidAddress(arg, arg2))
}

/// Parses a socket address argument. A bare IP address gets `default_port`.
fn parse_socket_address_arg(arg: String, maybe_arg2: Option<String>, default_port: u16) -> Result<SocketAddr, AddressErrorType> {
    let arg2 = match maybe_arg2 {
        Some(value) => value,
        None => return Err(AddressErrorType::UnexpectedEnd(arg)),
    };

    if let Ok(address) = arg2.parse::<SocketAddr>() {
        return Ok(address);
    }

    match arg2.parse::<IpAddr>() {
        Ok(ip) => Ok(SocketAddr::new(ip, default_port)),
        Err(_) => Err(AddressErrorType::InvalidAddress(arg, arg2)),
    }
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum PortErrorType {
    #[error("Expected integer after {0}")]
    UnexpectedEnd(String),

    #[error("Port number must be greater than 0 after {0}: {1}")]
    MustBeGreaterThanZero(String, String),

    #[error("Port number must be at most 16 bits after {0}: {1}")]
    TooLarge(String, String),

    #[error("Invalid port number after {0}: {1}")]
    InvalidValue(String, String),
}

fn parse_port_arg(arg: String, maybe_arg2: Option<String>) -> Result<NonZeroU16, PortErrorType> {
    let arg2 = match maybe_arg2 {
        Some(arg2) => arg2,
        None => return Err(PortErrorType::UnexpectedEnd(arg)),
    };

    arg2.parse::<NonZeroU16>().map_err(|parse_int_error| match parse_int_error.kind() {
        IntErrorKind::Zero | IntErrorKind::NegOverflow => PortErrorType::MustBeGreaterThanZero(arg, arg2),
        IntErrorKind::PosOverflow => PortErrorType::TooLarge(arg, arg2),
        _ => PortErrorType::InvalidValue(arg, arg2),
    })
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum IntegerErrorType {
    #[error("Expected integer after {0}")]
    UnexpectedEnd(String),

    #[error("Value must be greater than 0 after {0}: {1}")]
    MustBeGreaterThanZero(String, String),

    #[error("Value too large after {0}: {1}")]
    TooLarge(String, String),

    #[error("Invalid integer after {0}: {1}")]
    InvalidValue(String, String),
}

fn parse_integer_arg<T>(arg: String, maybe_arg2: Option<String>, allow_zero: bool) -> Result<T, IntegerErrorType>
where
    T: TryFrom<u64>,
{
    let arg2 = match maybe_arg2 {
        Some(arg2) => arg2,
        None => return Err(IntegerErrorType::UnexpectedEnd(arg)),
    };

    let value = match arg2.parse::<u64>() {
        Ok(0) if !allow_zero => return Err(IntegerErrorType::MustBeGreaterThanZero(arg, arg2)),
        Ok(value) => value,
        Err(parse_int_error) => {
            return Err(match parse_int_error.kind() {
                IntErrorKind::PosOverflow => IntegerErrorType::TooLarge(arg, arg2),
                _ => IntegerErrorType::InvalidValue(arg, arg2),
            })
        }
    };

    T::try_from(value).map_err(|_| IntegerErrorType::TooLarge(arg, arg2))
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum ChoiceErrorType {
    #[error("Expected one of {1} after {0}")]
    UnexpectedEnd(String, &'static str),

    #[error("Invalid value after {0}: {2} (expected one of {1})")]
    InvalidValue(String, &'static str, String),
}

/// Parses an argument that takes one of a fixed set of values, matched case-insensitively.
fn parse_choice_arg<T: Copy>(arg: String, maybe_arg2: Option<String>, choices: &[(&str, T)], expected: &'static str) -> Result<T, ChoiceErrorType> {
    let arg2 = match maybe_arg2 {
        Some(arg2) => arg2,
        None => return Err(ChoiceErrorType::UnexpectedEnd(arg, expected)),
    };

    choices
        .iter()
        .find(|(name, _)| arg2.eq_ignore_ascii_case(name))
        .map(|(_, value)| *value)
        .ok_or(ChoiceErrorType::InvalidValue(arg, expected, arg2))
}

const OVERFLOW_CHOICES: &[(&str, OverflowPolicy)] = &[
    ("drop-newest", OverflowPolicy::DropNewest),
    ("disconnect", OverflowPolicy::DisconnectClient),
];

const STREAM_POLICY_CHOICES: &[(&str, StreamPolicy)] = &[
    ("replace", StreamPolicy::ReplaceExisting),
    ("reject", StreamPolicy::RejectConcurrent),
];

pub fn parse_arguments<T>(mut args: T) -> Result<ArgumentsRequest, ArgumentsError>
where
    T: Iterator<Item = String>,
{
    let mut verbose = false;
    let mut is_server = false;
    let mut remote_address = None;
    let mut control_port = DEFAULT_CONTROL_PORT;
    let mut quic_port = DEFAULT_QUIC_PORT;
    let mut listen_address = DEFAULT_LISTEN_ADDRESS;
    let mut reuse_control_socket = false;
    let mut stream_policy = StreamPolicy::default();
    let mut relay = RelayConfig::default();
    let mut reconnect_attempts: u32 = 0;
    let mut reconnect_delay = DEFAULT_RECONNECT_DELAY;
    let mut rendezvous_timeout_secs = DEFAULT_RENDEZVOUS_TIMEOUT_SECS;
    let mut resend_interval_millis: u64 = 0;

    // Ignore the first argument, as it's by convention the name of the program
    args.next();

    while let Some(arg) = args.next() {
        if arg.is_empty() {
            continue;
        } else if arg.eq("-h") || arg.eq_ignore_ascii_case("--help") {
            return Ok(ArgumentsRequest::Help);
        } else if arg.eq("-V") || arg.eq_ignore_ascii_case("--version") {
            return Ok(ArgumentsRequest::Version);
        } else if arg.eq("-v") || arg.eq_ignore_ascii_case("--verbose") {
            verbose = true;
        } else if arg.eq("-s") || arg.eq_ignore_ascii_case("--server") {
            is_server = true;
        } else if arg.eq("-r") || arg.eq_ignore_ascii_case("--remote-address") {
            let address = parse_ip_address_arg(arg, args.next()).map_err(ArgumentsError::RemoteAddress)?;
            remote_address = Some(address);
        } else if arg.eq("-c") || arg.eq_ignore_ascii_case("--control-port") {
            control_port = parse_port_arg(arg, args.next()).map_err(ArgumentsError::Port)?.get();
        } else if arg.eq("-q") || arg.eq_ignore_ascii_case("--quic-port") {
            quic_port = parse_port_arg(arg, args.next()).map_err(ArgumentsError::Port)?.get();
        } else if arg.eq("-l") || arg.eq_ignore_ascii_case("--listen") {
            listen_address = parse_socket_address_arg(arg, args.next(), DEFAULT_LISTEN_PORT).map_err(ArgumentsError::Listen)?;
        } else if arg.eq_ignore_ascii_case("--reuse-control-socket") {
            reuse_control_socket = true;
        } else if arg.eq("-b") || arg.eq_ignore_ascii_case("--buffer-size") {
            relay.buffer_size = parse_integer_arg(arg, args.next(), false).map_err(ArgumentsError::Integer)?;
        } else if arg.eq_ignore_ascii_case("--chunk-size") {
            relay.chunk_size = parse_integer_arg(arg, args.next(), false).map_err(ArgumentsError::Integer)?;
        } else if arg.eq_ignore_ascii_case("--max-inflight") {
            relay.max_inflight = parse_integer_arg(arg, args.next(), false).map_err(ArgumentsError::Integer)?;
        } else if arg.eq_ignore_ascii_case("--overflow") {
            relay.overflow = parse_choice_arg(arg, args.next(), OVERFLOW_CHOICES, "drop-newest, disconnect").map_err(ArgumentsError::Choice)?;
        } else if arg.eq_ignore_ascii_case("--keep-buffer") {
            relay.retention = BufferRetention::KeepForNextClient;
        } else if arg.eq_ignore_ascii_case("--stream-policy") {
            stream_policy = parse_choice_arg(arg, args.next(), STREAM_POLICY_CHOICES, "replace, reject").map_err(ArgumentsError::Choice)?;
        } else if arg.eq_ignore_ascii_case("--open-window") {
            let millis = parse_integer_arg(arg, args.next(), false).map_err(ArgumentsError::Integer)?;
            relay.open_window = Duration::from_millis(millis);
        } else if arg.eq_ignore_ascii_case("--reconnect") {
            reconnect_attempts = parse_integer_arg(arg, args.next(), true).map_err(ArgumentsError::Integer)?;
        } else if arg.eq_ignore_ascii_case("--reconnect-delay") {
            let millis = parse_integer_arg(arg, args.next(), true).map_err(ArgumentsError::Integer)?;
            reconnect_delay = Duration::from_millis(millis);
        } else if arg.eq_ignore_ascii_case("--rendezvous-timeout") {
            rendezvous_timeout_secs = parse_integer_arg(arg, args.next(), true).map_err(ArgumentsError::Integer)?;
        } else if arg.eq_ignore_ascii_case("--resend-interval") {
            resend_interval_millis = parse_integer_arg(arg, args.next(), true).map_err(ArgumentsError::Integer)?;
        } else {
            return Err(ArgumentsError::UnknownArgument(arg));
        }
    }

    if !is_server && remote_address.is_none() {
        return Err(ArgumentsError::MissingRemoteAddress);
    }

    relay.reconnect = match reconnect_attempts {
        0 => ReconnectPolicy::Never,
        max_attempts => ReconnectPolicy::Limited {
            delay: reconnect_delay,
            max_attempts,
        },
    };

    let rendezvous = RendezvousConfig {
        timeout: (rendezvous_timeout_secs != 0).then(|| Duration::from_secs(rendezvous_timeout_secs)),
        resend_interval: (resend_interval_millis != 0).then(|| Duration::from_millis(resend_interval_millis)),
    };

    let startup_args = StartupArguments {
        verbose,
        is_server,
        remote_address,
        control_port,
        quic_port,
        listen_address,
        reuse_control_socket,
        stream_policy,
        rendezvous,
        relay,
    };

    Ok(ArgumentsRequest::Run(startup_args))
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        time::Duration,
    };

    use chownat_session_sm::StreamPolicy;

    use super::*;

    fn parse(args: &[&str]) -> Result<ArgumentsRequest, ArgumentsError> {
        parse_arguments(std::iter::once("chownat").chain(args.iter().copied()).map(String::from))
    }

    fn parse_run(args: &[&str]) -> StartupArguments {
        match parse(args) {
            Ok(ArgumentsRequest::Run(startup_args)) => startup_args,
            other => panic!("Expected run arguments, got {other:?}"),
        }
    }

    #[test]
    fn test_connector_defaults() {
        let args = parse_run(&["-r", "203.0.113.7"]);
        assert!(!args.is_server);
        assert!(!args.verbose);
        assert_eq!(args.remote_address, Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))));
        assert_eq!(args.control_port, 50071);
        assert_eq!(args.quic_port, 50072);
        assert_eq!(args.listen_address, "127.0.0.1:8080".parse().unwrap());
        assert!(!args.reuse_control_socket);
        assert_eq!(args.stream_policy, StreamPolicy::ReplaceExisting);
        assert_eq!(args.relay, RelayConfig::default());
        assert_eq!(args.rendezvous.timeout, Some(Duration::from_secs(60)));
        assert_eq!(args.rendezvous.resend_interval, None);
    }

    #[test]
    fn test_connector_requires_remote_address() {
        assert_eq!(parse(&[]), Err(ArgumentsError::MissingRemoteAddress));
        assert_eq!(parse(&["-v"]), Err(ArgumentsError::MissingRemoteAddress));
    }

    #[test]
    fn test_server_without_remote_address() {
        let args = parse_run(&["--server"]);
        assert!(args.is_server);
        assert_eq!(args.remote_address, None);
    }

    #[test]
    fn test_all_options() {
        let args = parse_run(&[
            "-s",
            "-v",
            "-r",
            "::1",
            "-c",
            "6000",
            "-q",
            "6001",
            "-l",
            "0.0.0.0:9000",
            "--reuse-control-socket",
            "-b",
            "65536",
            "--chunk-size",
            "1024",
            "--max-inflight",
            "8192",
            "--overflow",
            "disconnect",
            "--keep-buffer",
            "--stream-policy",
            "REJECT",
            "--open-window",
            "250",
            "--reconnect",
            "3",
            "--reconnect-delay",
            "500",
            "--rendezvous-timeout",
            "0",
            "--resend-interval",
            "200",
        ]);

        assert!(args.is_server);
        assert!(args.verbose);
        assert_eq!(args.remote_address, Some("::1".parse().unwrap()));
        assert_eq!(args.control_port, 6000);
        assert_eq!(args.quic_port, 6001);
        assert_eq!(args.listen_address, "0.0.0.0:9000".parse().unwrap());
        assert!(args.reuse_control_socket);
        assert_eq!(args.stream_policy, StreamPolicy::RejectConcurrent);
        assert_eq!(
            args.relay,
            RelayConfig {
                chunk_size: 1024,
                buffer_size: 65536,
                max_inflight: 8192,
                overflow: OverflowPolicy::DisconnectClient,
                retention: BufferRetention::KeepForNextClient,
                open_window: Duration::from_millis(250),
                reconnect: ReconnectPolicy::Limited {
                    delay: Duration::from_millis(500),
                    max_attempts: 3,
                },
            }
        );
        assert_eq!(args.rendezvous.timeout, None);
        assert_eq!(args.rendezvous.resend_interval, Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_listen_address_without_port() {
        let args = parse_run(&["-s", "--listen", "10.0.0.1"]);
        assert_eq!(args.listen_address, SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 8080));
    }

    #[test]
    fn test_help_and_version_win() {
        assert_eq!(parse(&["-h"]), Ok(ArgumentsRequest::Help));
        assert_eq!(parse(&["--bogus-but-after", "-V"]), Err(ArgumentsError::UnknownArgument("--bogus-but-after".into())));
        assert_eq!(parse(&["-V", "--bogus"]), Ok(ArgumentsRequest::Version));
    }

    #[test]
    fn test_invalid_values() {
        assert_eq!(
            parse(&["-s", "-c", "0"]),
            Err(ArgumentsError::Port(PortErrorType::MustBeGreaterThanZero("-c".into(), "0".into())))
        );
        assert_eq!(
            parse(&["-s", "-q", "70000"]),
            Err(ArgumentsError::Port(PortErrorType::TooLarge("-q".into(), "70000".into())))
        );
        assert_eq!(parse(&["-s", "-r"]), Err(ArgumentsError::RemoteAddress(AddressErrorType::UnexpectedEnd("-r".into()))));
        assert_eq!(
            parse(&["-s", "--chunk-size", "0"]),
            Err(ArgumentsError::Integer(IntegerErrorType::MustBeGreaterThanZero("--chunk-size".into(), "0".into())))
        );
        assert_eq!(
            parse(&["-s", "--reconnect", "99999999999"]),
            Err(ArgumentsError::Integer(IntegerErrorType::TooLarge("--reconnect".into(), "99999999999".into())))
        );
        assert_eq!(
            parse(&["-s", "--overflow", "drop-oldest"]),
            Err(ArgumentsError::Choice(ChoiceErrorType::InvalidValue(
                "--overflow".into(),
                "drop-newest, disconnect",
                "drop-oldest".into()
            )))
        );
        assert_eq!(parse(&["-s", "--what"]), Err(ArgumentsError::UnknownArgument("--what".into())));
    }
}
