//! The non-server subcommands.

use anyhow::Result;

use crate::config::{Command, HostnameAction, UserAction};
use crate::credentials::CredentialStore;
use crate::pki;

pub async fn execute(command: Command) -> Result<()> {
    match command {
        // `start` is handled by the binary itself.
        Command::Start(_) => unreachable!(),

        Command::Certgen(args) => {
            pki::generate_certificate(
                &args.cert_file,
                &args.key_file,
                &args.common_name,
                args.key_file_password.as_deref(),
            )?;

            println!(
                "wrote certificate to {:?} and key to {:?}",
                args.cert_file, args.key_file
            );
        }

        Command::Keygen(args) => {
            pki::generate_key(&args.key_file, args.key_file_password.as_deref())?;
            println!("wrote key to {:?}", args.key_file);
        }

        Command::Certdump(args) => {
            print!("{}", pki::dump(&args.cert_file)?);
        }

        Command::User(args) => {
            let store = CredentialStore::open(&args.database).await?;

            match args.action {
                UserAction::Add {
                    username,
                    password,
                    admin,
                } => {
                    store.add_user(&username, &password, admin).await?;
                    println!("added user {:?}", username);
                }
                UserAction::Remove { username } => {
                    if store.remove_user(&username).await? {
                        println!("removed user {:?}", username);
                    } else {
                        anyhow::bail!("no user named {:?}", username);
                    }
                }
                UserAction::List => {
                    for username in store.usernames().await? {
                        println!("{}", username);
                    }
                }
            }
        }

        Command::Hostname(args) => {
            let store = CredentialStore::open(&args.database).await?;

            match args.action {
                HostnameAction::Add { hostname } => {
                    store.add_hostname(&hostname).await?;
                    println!("added hostname {:?}", hostname);
                }
                HostnameAction::Remove { hostname } => {
                    if store.remove_hostname(&hostname).await? {
                        println!("removed hostname {:?}", hostname);
                    } else {
                        anyhow::bail!("no hostname {:?}", hostname);
                    }
                }
                HostnameAction::List => {
                    for hostname in store.hostnames().await? {
                        println!("{}", hostname);
                    }
                }
            }
        }

        Command::Delete(args) => {
            for path in [&args.database, &args.cert_file, &args.key_file] {
                match std::fs::remove_file(path) {
                    Ok(()) => println!("removed {:?}", path),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    Ok(())
}
