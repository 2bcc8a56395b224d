// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod authenticode;
mod byte_window;
mod container;
mod credentials;
mod digest;
mod error;
mod signing;
mod timestamp;
mod verify;

use {
    crate::{
        byte_window::{ByteWindow, OutputSink},
        container::{cab::CabHandler, msi::MsiHandler, pe::PeHandler, FileType},
        credentials::SigningIdentity,
        digest::DigestAlgorithm,
        error::{AuthenticodeError, Result},
        signing::{SignedMessageBuilder, StatementKind},
        timestamp::TimestampRequest,
    },
    clap::{Arg, ArgGroup, ArgMatches, Command},
    log::{info, LevelFilter},
    std::path::PathBuf,
};

/// Loads the signing identity named by whichever credential flags were
/// given: a PKCS#12 bundle, or a certificate paired with a PEM private key.
/// PVK-format keys are accepted syntactically (the CLI surface lists them
/// as a valid combination) but have no parser backing them here.
fn load_signing_identity(args: &ArgMatches) -> Result<SigningIdentity> {
    let password = args.value_of("pass").unwrap_or("");

    if let Some(pkcs12_path) = args.value_of("pkcs12") {
        let data = std::fs::read(pkcs12_path)?;
        return credentials::load_pkcs12(&data, password);
    }

    let spc_path = args.value_of("spc").ok_or_else(|| {
        AuthenticodeError::InvalidArgs(
            "one of --pkcs12 or --spc (with --key or --pvk) is required".into(),
        )
    })?;
    let cert_data = std::fs::read(spc_path)?;

    if let Some(key_path) = args.value_of("key") {
        let key_data = std::fs::read(key_path)?;
        return credentials::load_pem(&cert_data, &key_data);
    }

    if args.value_of("pvk").is_some() {
        return Err(AuthenticodeError::UnsupportedFeature(
            "PVK-format private keys are not supported; convert the key to PKCS#8 PEM/DER and use --key instead".into(),
        ));
    }

    Err(AuthenticodeError::InvalidArgs(
        "--spc requires either --key or --pvk".into(),
    ))
}

fn command_sign(args: &ArgMatches) -> Result<()> {
    let input_path = PathBuf::from(args.value_of("input").expect("input is required"));
    let output_path = PathBuf::from(args.value_of("output").expect("output is required"));

    let window = ByteWindow::open(&input_path)?;
    let file_type = container::detect_file_type(window.as_slice())?;

    let algorithm = match args.value_of("hash") {
        Some(h) => DigestAlgorithm::try_from(h)?,
        None => DigestAlgorithm::default(),
    };

    let identity = load_signing_identity(args)?;

    let statement_kind = if args.is_present("comm") {
        StatementKind::Commercial
    } else {
        StatementKind::Individual
    };

    let include_ms_java = match args.value_of("jp") {
        Some("low") => {
            if file_type != FileType::Cab {
                return Err(AuthenticodeError::InvalidArgs(
                    "--jp low only applies to CAB containers".into(),
                ));
            }
            true
        }
        Some(_) => {
            return Err(AuthenticodeError::InvalidArgs(
                "--jp accepts only \"low\"".into(),
            ));
        }
        None => false,
    };

    let timestamp = match (args.value_of("t"), args.value_of("ts")) {
        (Some(_), Some(_)) => {
            return Err(AuthenticodeError::InvalidArgs(
                "-t and -ts are mutually exclusive".into(),
            ));
        }
        (Some(url), None) => Some(TimestampRequest::Legacy {
            url: url.to_string(),
            proxy: args.value_of("proxy").map(str::to_string),
        }),
        (None, Some(url)) => Some(TimestampRequest::Rfc3161 { url: url.to_string() }),
        (None, None) => None,
    };

    let mut builder = SignedMessageBuilder::new(&identity, file_type, algorithm).statement_kind(statement_kind);
    if include_ms_java {
        builder = builder.include_ms_java(true);
    }
    if let Some(name) = args.value_of("name") {
        builder = builder.program_name(name.to_string());
    }
    if let Some(url) = args.value_of("url") {
        builder = builder.more_info_url(url.to_string());
    }
    if let Some(request) = timestamp {
        builder = builder.timestamp(request);
    }

    match file_type {
        FileType::Pe => {
            let handler = PeHandler::open(&window)?;
            let digest = handler.digest(algorithm)?;
            let signature_der = builder.build(&digest)?;
            let mut output = OutputSink::create(&output_path)?;
            handler.sign(&mut output, &signature_der)?;
            output.finish()?;
        }
        FileType::Cab => {
            let handler = CabHandler::open(&window)?;
            let digest = handler.digest(algorithm)?;
            let signature_der = builder.build(&digest)?;
            let mut output = OutputSink::create(&output_path)?;
            handler.sign(&mut output, algorithm, &signature_der)?;
            output.finish()?;
        }
        FileType::Msi => {
            let handler = MsiHandler::open(&input_path)?;
            let digest = handler.digest(algorithm)?;
            let signature_der = builder.build(&digest)?;
            if let Err(e) = handler.sign(&output_path, &signature_der) {
                let _ = std::fs::remove_file(&output_path);
                return Err(e);
            }
        }
    }

    info!(
        "signed {} ({:?}, {}) -> {}",
        input_path.display(),
        file_type,
        algorithm,
        output_path.display()
    );
    Ok(())
}

fn command_extract_signature(args: &ArgMatches) -> Result<()> {
    let input_path = PathBuf::from(args.value_of("input").expect("input is required"));
    let output_path = PathBuf::from(args.value_of("output").expect("output is required"));

    let window = ByteWindow::open(&input_path)?;
    let file_type = container::detect_file_type(window.as_slice())?;

    let mut output = OutputSink::create(&output_path)?;
    match file_type {
        FileType::Pe => {
            let handler = PeHandler::open(&window)?;
            handler.extract_signature(&mut output)?;
        }
        FileType::Cab => {
            let handler = CabHandler::open(&window)?;
            let signature = handler.extract_signature()?.ok_or_else(|| {
                AuthenticodeError::VerificationFailed("file carries no reserved signature area".into())
            })?;
            output.write_all(&signature)?;
        }
        FileType::Msi => {
            let handler = MsiHandler::open(&input_path)?;
            let signature = handler.extract_signature()?.ok_or_else(|| {
                AuthenticodeError::VerificationFailed("file carries no \\005DigitalSignature stream".into())
            })?;
            output.write_all(&signature)?;
        }
    }
    output.finish()?;

    info!("extracted signature from {} -> {}", input_path.display(), output_path.display());
    Ok(())
}

fn command_remove_signature(args: &ArgMatches) -> Result<()> {
    let input_path = PathBuf::from(args.value_of("input").expect("input is required"));
    let output_path = PathBuf::from(args.value_of("output").expect("output is required"));

    let window = ByteWindow::open(&input_path)?;
    let file_type = container::detect_file_type(window.as_slice())?;

    match file_type {
        FileType::Pe => {
            let handler = PeHandler::open(&window)?;
            let mut output = OutputSink::create(&output_path)?;
            handler.remove_signature(&mut output)?;
            output.finish()?;
        }
        FileType::Cab => {
            let handler = CabHandler::open(&window)?;
            let mut output = OutputSink::create(&output_path)?;
            handler.remove_signature(&mut output)?;
            output.finish()?;
        }
        FileType::Msi => {
            let handler = MsiHandler::open(&input_path)?;
            if let Err(e) = handler.remove_signature(&output_path) {
                let _ = std::fs::remove_file(&output_path);
                return Err(e);
            }
        }
    }

    info!("removed signature from {} -> {}", input_path.display(), output_path.display());
    Ok(())
}

fn command_verify(args: &ArgMatches) -> Result<()> {
    let input_path = PathBuf::from(args.value_of("input").expect("input is required"));
    let report = verify::verify(&input_path)?;

    if let Some(checksum_valid) = report.checksum_valid {
        println!("Checksum: {}", if checksum_valid { "ok" } else { "MISMATCH" });
    }

    let signature_ok =
        report.digest_matches && !report.signers.is_empty() && report.signers.iter().all(|s| s.signature_valid);
    println!("Signature verification: {}", if signature_ok { "ok" } else { "FAILED" });

    for signer in &report.signers {
        println!(
            "Signer: subject=\"{}\" issuer=\"{}\" digest={} timestamped={}",
            signer.subject, signer.issuer, signer.digest_algorithm, signer.time_stamped
        );
    }

    if let Some((algorithm, preview)) = &report.page_hash_preview {
        println!("Page hash ({algorithm}): {}...", hex::encode(preview));
    }

    if !report.success() {
        return Err(AuthenticodeError::VerificationFailed(
            "container digest, checksum, or signature did not validate".into(),
        ));
    }
    Ok(())
}

fn credential_args() -> Vec<Arg<'static>> {
    vec![
        Arg::new("spc")
            .long("spc")
            .takes_value(true)
            .value_name("FILE")
            .help("Path to the signer's SPC/PEM certificate file"),
        Arg::new("key")
            .long("key")
            .takes_value(true)
            .value_name("FILE")
            .requires("spc")
            .conflicts_with("pvk")
            .help("Path to a PKCS#8 PEM/DER private key file, used with --spc"),
        Arg::new("pvk")
            .long("pvk")
            .takes_value(true)
            .value_name("FILE")
            .requires("spc")
            .help("Path to a PVK-format private key file, used with --spc (unsupported; always errors)"),
        Arg::new("pkcs12")
            .long("pkcs12")
            .takes_value(true)
            .value_name("FILE")
            .conflicts_with_all(&["spc", "key", "pvk"])
            .help("Path to a PKCS#12 (.p12/.pfx) bundle containing both certificate and key"),
        Arg::new("pass")
            .long("pass")
            .takes_value(true)
            .value_name("PASSWORD")
            .help("Password unlocking the PKCS#12 bundle or encrypted private key"),
    ]
}

fn main_impl() -> Result<()> {
    let app = Command::new("authenticode")
        .about("Embeds, extracts, removes, and verifies Authenticode signatures in PE, CAB, and MSI files")
        .version(env!("CARGO_PKG_VERSION"))
        .mut_arg("version", |a| a.short('v'))
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity (may be given more than once)"),
        );

    let app = app.subcommand({
        let mut sign = Command::new("sign")
            .about("Signs a PE, CAB, or MSI file")
            .disable_help_flag(true)
            .group(ArgGroup::new("credentials").args(&["spc", "pkcs12"]).required(true))
            .group(ArgGroup::new("timestamp").args(&["t", "ts"]));
        for arg in credential_args() {
            sign = sign.arg(arg);
        }
        sign.arg(
            Arg::new("hash")
                .short('h')
                .long("hash")
                .takes_value(true)
                .value_name("ALGORITHM")
                .possible_values(&["md5", "sha1", "sha2"])
                .help("Digest algorithm (default sha1)"),
        )
        .arg(
            Arg::new("name")
                .short('n')
                .long("name")
                .takes_value(true)
                .value_name("DESC")
                .help("Program description shown by verifiers (SpcSpOpusInfo programName)"),
        )
        .arg(
            Arg::new("url")
                .short('i')
                .long("info-url")
                .takes_value(true)
                .value_name("URL")
                .help("More-information URL shown by verifiers (SpcSpOpusInfo moreInfo)"),
        )
        .arg(
            Arg::new("jp")
                .long("jp")
                .takes_value(true)
                .value_name("LEVEL")
                .help("Java permission level; only \"low\" is supported and attaches the MS-Java attribute (CAB only)"),
        )
        .arg(
            Arg::new("comm")
                .long("comm")
                .help("Mark the signature as commercial rather than individual (SpcStatementType)"),
        )
        .arg(
            Arg::new("t")
                .long("t")
                .takes_value(true)
                .value_name("TSURL")
                .help("Legacy Authenticode timestamp server URL"),
        )
        .arg(
            Arg::new("ts")
                .long("ts")
                .takes_value(true)
                .value_name("TSURL")
                .help("RFC 3161 timestamp server URL"),
        )
        .arg(
            Arg::new("proxy")
                .short('p')
                .long("proxy")
                .takes_value(true)
                .value_name("PROXY")
                .help("HTTP or SOCKS proxy used for the timestamp request"),
        )
        .arg(
            Arg::new("input")
                .required(true)
                .value_name("IN")
                .help("Path to the unsigned input file"),
        )
        .arg(
            Arg::new("output")
                .required(true)
                .value_name("OUT")
                .help("Path to write the signed output file"),
        )
    });

    let app = app.subcommand(
        Command::new("extract-signature")
            .about("Extracts the raw PKCS#7 signature from a signed file")
            .arg(
                Arg::new("input")
                    .required(true)
                    .value_name("IN")
                    .help("Path to the signed input file"),
            )
            .arg(
                Arg::new("output")
                    .required(true)
                    .value_name("OUT")
                    .help("Path to write the extracted PKCS#7 DER"),
            ),
    );

    let app = app.subcommand(
        Command::new("remove-signature")
            .about("Removes an embedded signature, restoring the container's unsigned layout")
            .arg(
                Arg::new("input")
                    .required(true)
                    .value_name("IN")
                    .help("Path to the signed input file"),
            )
            .arg(
                Arg::new("output")
                    .required(true)
                    .value_name("OUT")
                    .help("Path to write the unsigned output file"),
            ),
    );

    let app = app.subcommand(
        Command::new("verify")
            .about("Verifies an embedded Authenticode signature")
            .arg(
                Arg::new("input")
                    .required(true)
                    .value_name("IN")
                    .help("Path to the file to verify"),
            ),
    );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level.as_str()));
    if log_level <= LevelFilter::Info {
        builder.format_timestamp(None).format_level(false).format_target(false);
    }
    if log_level == LevelFilter::Info {
        builder.filter_module("rustls", LevelFilter::Error);
    }
    builder.init();

    match matches.subcommand() {
        Some(("sign", args)) => command_sign(args),
        Some(("extract-signature", args)) => command_extract_signature(args),
        Some(("remove-signature", args)) => command_remove_signature(args),
        Some(("verify", args)) => command_verify(args),
        _ => Err(AuthenticodeError::InvalidArgs("no subcommand given".into())),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{err}");
            eprintln!("Failed");
            1
        }
    };

    std::process::exit(exit_code)
}
