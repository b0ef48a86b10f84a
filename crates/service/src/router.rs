//! Frame classification and dispatch.
//!
//! Every frame a ready session produces lands here. Requests addressed to
//! `"Manager"` are handled in place; everything else moves between peer
//! queues guided by the directory, the link table, and the pending table.
//!
//! Ordering: a frame is routed entirely on its session's reader task before
//! the next frame of that session is parsed, and every destination has a
//! single writer queue, so frames between one sender and one receiver stay
//! in send order. No cross-sender order is promised.

use std::net::SocketAddr;
use std::time::Instant;

use serde_json::{Value, json};

use crate::{
    Service, ServiceHandler,
    error::{ErrorKind, Fault},
    message::{self, MANAGER_SERVICE, Message, NOTIFICATION_UID, Notification, Reply, Request},
    pending::PendingRequest,
    session::Role,
};

/// What the connection task must do after a frame was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Continue,
    /// A fatal protocol fault; the offending session must be closed.
    CloseSession,
}

/// Origin-session snapshot taken before classification so routing never
/// holds the registry lock.
struct Origin {
    role: Role,
    name: String,
    admin: bool,
    terminal: bool,
}

impl<T> Service<T>
where
    T: ServiceHandler,
{
    /// Route one decoded frame from a ready session.
    pub async fn route(&self, origin: SocketAddr, frame: Value) -> RouteOutcome {
        let info = {
            let sessions = self.inner().sessions().read();
            match sessions.get(&origin) {
                Some(peer) => Origin {
                    role: peer.role,
                    name: peer.name.clone(),
                    admin: peer.admin,
                    terminal: peer.terminal,
                },
                // The session raced its own close; nothing to route.
                None => return RouteOutcome::Continue,
            }
        };

        match Message::classify(&frame) {
            Ok(Message::Request(request)) => self.route_request(origin, info, request, frame).await,
            Ok(Message::Reply(reply)) => self.route_reply(origin, info, reply, frame),
            Ok(Message::Notification(notification)) => {
                self.route_notification(origin, info, notification, frame)
            }
            Err(detail) => {
                // Wrong shape is answered, not fatal; the peer may recover.
                let uid = frame
                    .get("uid")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.send_fault(&origin, &Fault::new(ErrorKind::Protocol, detail), &uid);
                RouteOutcome::Continue
            }
        }
    }

    async fn route_request(
        &self,
        origin: SocketAddr,
        info: Origin,
        request: Request,
        mut frame: Value,
    ) -> RouteOutcome {
        if request.uid == NOTIFICATION_UID {
            self.send_fault(
                &origin,
                &Fault::new(
                    ErrorKind::ReservedUid,
                    "the notification uid is reserved for broadcasts",
                ),
                "",
            );
            return RouteOutcome::CloseSession;
        }

        if request.service == MANAGER_SERVICE {
            return self.dispatch_admin(origin, info, request).await;
        }

        if info.role != Role::Client {
            self.send_fault(
                &origin,
                &Fault::new(ErrorKind::Protocol, "services do not originate requests"),
                &request.uid,
            );
            return RouteOutcome::Continue;
        }

        if self.is_draining() {
            self.send_fault(
                &origin,
                &Fault::new(ErrorKind::Draining, "the manager is shutting down"),
                &request.uid,
            );
            return RouteOutcome::Continue;
        }

        let target = self
            .inner()
            .directory()
            .read()
            .get(&request.service)
            .copied();
        let Some(target) = target else {
            self.send_fault(
                &origin,
                &Fault::new(
                    ErrorKind::NoSuchService,
                    format!("no service named {:?}", request.service),
                ),
                &request.uid,
            );
            return RouteOutcome::Continue;
        };

        // Terminal sessions bypass the link requirement, everyone else must
        // have linked first.
        if !info.terminal && !self.inner().links().lock().is_linked(&origin, &request.service) {
            self.send_fault(
                &origin,
                &Fault::new(
                    ErrorKind::NotLinked,
                    format!("no active link to service {:?}", request.service),
                ),
                &request.uid,
            );
            return RouteOutcome::Continue;
        }

        let entry = PendingRequest {
            client: origin,
            service: request.service.clone(),
            target,
            uid: request.uid.clone(),
            enqueued: Instant::now(),
            deadline: self
                .inner()
                .request_timeout()
                .map(|timeout| Instant::now() + timeout),
        };

        if self.inner().pending().lock().insert(entry).is_err() {
            self.send_fault(
                &origin,
                &Fault::new(
                    ErrorKind::DuplicateUid,
                    format!("uid {:?} is already in flight", request.uid),
                ),
                &request.uid,
            );
            return RouteOutcome::Continue;
        }

        if let Some(object) = frame.as_object_mut() {
            object.insert("requester".to_string(), Value::String(origin.to_string()));
        }

        // The target can vanish between the directory lookup and the insert;
        // settle immediately instead of leaking the entry.
        if !self.inner().sessions().read().contains_key(&target) {
            self.inner().pending().lock().settle(&origin, &request.uid);
            self.send_fault(
                &origin,
                &Fault::new(
                    ErrorKind::ServiceGone,
                    format!("service {:?} closed before replying", request.service),
                ),
                &request.uid,
            );
            return RouteOutcome::Continue;
        }

        self.send_value(&target, &frame);
        RouteOutcome::Continue
    }

    fn route_reply(
        &self,
        origin: SocketAddr,
        info: Origin,
        reply: Reply,
        frame: Value,
    ) -> RouteOutcome {
        if info.role != Role::Service {
            self.send_fault(
                &origin,
                &Fault::new(
                    ErrorKind::Protocol,
                    "reply frames are only accepted from services",
                ),
                &reply.uid,
            );
            return RouteOutcome::Continue;
        }

        let Ok(requester) = reply.requester.parse::<SocketAddr>() else {
            log::warn!(
                "reply dropped, unparseable requester: service={:?}, requester={:?}, uid={:?}",
                info.name,
                reply.requester,
                reply.uid
            );
            return RouteOutcome::Continue;
        };

        let entry = {
            let mut pending = self.inner().pending().lock();
            match pending.settle(&requester, &reply.uid) {
                Some(entry) if entry.target != origin => {
                    // Replies only count from the service the request went
                    // to; anything else leaves the entry in place.
                    let _ = pending.insert(entry);
                    None
                }
                other => other,
            }
        };

        if entry.is_none() {
            log::warn!(
                "reply dropped, no matching pending request: service={:?}, requester={:?}, uid={:?}",
                info.name,
                reply.requester,
                reply.uid
            );
            return RouteOutcome::Continue;
        }

        // Forwarded unchanged; discarded silently when the client closed in
        // the meantime (its registry entry is already gone).
        self.send_value(&requester, &frame);
        RouteOutcome::Continue
    }

    fn route_notification(
        &self,
        origin: SocketAddr,
        info: Origin,
        notification: Notification,
        frame: Value,
    ) -> RouteOutcome {
        if info.role != Role::Service || info.name != notification.service {
            self.send_fault(
                &origin,
                &Fault::new(
                    ErrorKind::Protocol,
                    "notification service does not match the sending session",
                ),
                NOTIFICATION_UID,
            );
            return RouteOutcome::Continue;
        }

        let clients = self.inner().links().lock().linked_clients(&info.name);
        if clients.is_empty() {
            return RouteOutcome::Continue;
        }

        // Encode once; per-client queues preserve the emission order.
        let bytes = match codec::encode_frame(self.backend(), &frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("notification encode failed: service={:?}, err={}", info.name, e);
                return RouteOutcome::Continue;
            }
        };

        let sessions = self.inner().sessions().read();
        for client in clients {
            if let Some(peer) = sessions.get(&client) {
                peer.send(bytes.clone());
            }
        }

        RouteOutcome::Continue
    }

    /// Requests addressed to the manager itself.
    async fn dispatch_admin(
        &self,
        origin: SocketAddr,
        info: Origin,
        request: Request,
    ) -> RouteOutcome {
        let requester = origin.to_string();
        let uid = request.uid.clone();

        let reply = |result: Value| {
            self.send_value(&origin, &message::reply_frame(result, &requester, &uid));
        };
        let refuse = |fault: Fault| {
            self.send_fault(&origin, &fault, &uid);
        };

        match request.attribute.as_str() {
            "identity" => reply(self.manager_identity()),

            "link" => {
                let Some(name) = str_arg(&request, 0, "service") else {
                    refuse(Fault::new(ErrorKind::Protocol, "link requires a service name"));
                    return RouteOutcome::Continue;
                };

                let target = self.inner().directory().read().get(&name).copied();
                let identity = target.and_then(|address| {
                    self.inner()
                        .sessions()
                        .read()
                        .get(&address)
                        .map(|peer| (peer.max_clients, peer.identity.clone()))
                });

                let Some((cap, identity)) = identity else {
                    refuse(Fault::new(
                        ErrorKind::NoSuchService,
                        format!("no service named {:?}", name),
                    ));
                    return RouteOutcome::Continue;
                };

                match self.inner().links().lock().link(origin, &name, cap) {
                    Ok(()) => {
                        self.inner().handler().on_link(&origin, &name);
                        reply(identity);
                    }
                    Err(refused) => refuse(refused.into_fault(&name)),
                }
            }

            "unlink" => {
                let Some(name) = str_arg(&request, 0, "service") else {
                    refuse(Fault::new(ErrorKind::Protocol, "unlink requires a service name"));
                    return RouteOutcome::Continue;
                };

                self.inner().links().lock().unlink(&origin, &name);
                self.inner().handler().on_unlink(&origin, &name);
                reply(json!(true));
            }

            "lock" => {
                let Some(name) = str_arg(&request, 0, "service") else {
                    refuse(Fault::new(ErrorKind::Protocol, "lock requires a service name"));
                    return RouteOutcome::Continue;
                };

                let mode = str_arg(&request, 1, "mode").unwrap_or_else(|| "exclusive".to_string());
                let Some(mode) = crate::links::LockMode::parse(&mode) else {
                    refuse(Fault::new(
                        ErrorKind::Protocol,
                        format!("unknown lock mode {:?}", mode),
                    ));
                    return RouteOutcome::Continue;
                };

                match self.inner().links().lock().lock(&origin, &name, mode) {
                    Ok(()) => reply(json!(true)),
                    Err(refused) => refuse(refused.into_fault(&name)),
                }
            }

            "unlock" => {
                let Some(name) = str_arg(&request, 0, "service") else {
                    refuse(Fault::new(ErrorKind::Protocol, "unlock requires a service name"));
                    return RouteOutcome::Continue;
                };

                self.inner().links().lock().unlock(&origin, &name);
                reply(json!(true));
            }

            "list_services" => reply(self.list_services()),

            "cancel_request" => {
                let Some(cancel) = str_arg(&request, 0, "uid") else {
                    refuse(Fault::new(ErrorKind::Protocol, "cancel_request requires a uid"));
                    return RouteOutcome::Continue;
                };

                let removed = self.inner().pending().lock().settle(&origin, &cancel).is_some();
                reply(json!(removed));
            }

            "shutdown_manager" => {
                if !info.admin {
                    refuse(Fault::new(
                        ErrorKind::PermissionDenied,
                        "shutdown_manager requires an admin login",
                    ));
                    return RouteOutcome::Continue;
                }

                log::info!("shutdown requested: addr={:?}, name={:?}", origin, info.name);
                reply(Value::Null);
                self.inner().handler().on_shutdown();
            }

            "kick" => {
                if !info.admin {
                    refuse(Fault::new(
                        ErrorKind::PermissionDenied,
                        "kick requires an admin login",
                    ));
                    return RouteOutcome::Continue;
                }

                let address = str_arg(&request, 0, "address")
                    .and_then(|address| address.parse::<SocketAddr>().ok());
                let Some(address) = address else {
                    refuse(Fault::new(ErrorKind::Protocol, "kick requires a peer address"));
                    return RouteOutcome::Continue;
                };

                log::info!("kick requested: addr={:?}, target={:?}", origin, address);
                let known = self.kick(&address);
                reply(json!(known));
            }

            "users_table.is_user_registered" => {
                let Some(username) = str_arg(&request, 0, "username") else {
                    refuse(Fault::new(ErrorKind::Protocol, "a username is required"));
                    return RouteOutcome::Continue;
                };

                let registered = self.inner().handler().is_user_registered(&username).await;
                reply(json!(registered));
            }

            "users_table.usernames" => {
                let usernames = self.inner().handler().usernames().await;
                reply(json!(usernames));
            }

            "hostnames_table.hostnames" => {
                let hostnames = self.inner().handler().hostnames().await;
                reply(json!(hostnames));
            }

            other => refuse(Fault::new(
                ErrorKind::Protocol,
                format!("the manager has no attribute {:?}", other),
            )),
        }

        RouteOutcome::Continue
    }
}

/// Fetch a string argument positionally with a keyword fallback.
fn str_arg(request: &Request, index: usize, key: &str) -> Option<String> {
    request
        .args
        .get(index)
        .and_then(Value::as_str)
        .or_else(|| request.kwargs.get(key).and_then(Value::as_str))
        .map(str::to_string)
}
