pub mod clock;
pub mod queue;
pub mod registry;

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use actix::prelude::*;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::game::rules::{MoveRequest, RulesEngine, StandardChess};
use crate::models::{
    ClientIntent, ConnId, Connect, Disconnect, DisconnectNote, DrawReason, Frame, Inbound,
    MatchOutcome, MoveDisposition, ParticipantId, Presence, RejectReason, RejoinFailure, Sequel,
    ServerEvent, SessionId, SideColor, WinReason,
};
use queue::MatchQueue;
use registry::SessionRegistry;

/// Central actor owning all matchmaking and session state. Its mailbox is
/// the single logical thread of control: every mutation of the queue, the
/// registry, or a session happens inside one handler invocation, and all
/// waiting is expressed as scheduled callbacks on this same actor. Each
/// callback re-validates whatever it closed over (session still present,
/// clock generation still current, participant still disconnected) before
/// acting, because arbitrarily many events may have run in between.
pub struct MatchServer {
    config: ServerConfig,
    rules: Box<dyn RulesEngine>,
    registry: SessionRegistry,
    queue: MatchQueue,
    /// Every open socket, playing or not.
    connections: HashMap<ConnId, Recipient<Frame>>,
    /// Subscribers (players and spectators) per session channel.
    channels: HashMap<SessionId, HashSet<ConnId>>,
    /// Live clock-tick schedule per session.
    tick_handles: HashMap<SessionId, SpawnHandle>,
    /// One pending grace timer per disconnected participant.
    grace_handles: HashMap<(SessionId, ParticipantId), SpawnHandle>,
}

impl MatchServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rules: Box::new(StandardChess),
            registry: SessionRegistry::new(),
            queue: MatchQueue::new(),
            connections: HashMap::new(),
            channels: HashMap::new(),
            tick_handles: HashMap::new(),
            grace_handles: HashMap::new(),
        }
    }

    // ---- fan-out ---------------------------------------------------------

    fn send_to_conn(&self, conn: ConnId, event: &ServerEvent) {
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(error) => {
                warn!("failed to serialize event: {error}");
                return;
            }
        };
        if let Some(addr) = self.connections.get(&conn) {
            addr.do_send(Frame(frame));
        } else {
            debug!("connection {conn} is gone; dropping event");
        }
    }

    fn broadcast_session(&self, session_id: SessionId, event: &ServerEvent) {
        let subscribers = match self.channels.get(&session_id) {
            Some(subscribers) => subscribers,
            None => return,
        };
        // serialize once for the whole channel
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(error) => {
                warn!("failed to serialize event: {error}");
                return;
            }
        };
        for conn in subscribers {
            if let Some(addr) = self.connections.get(conn) {
                addr.do_send(Frame(frame.clone()));
            }
        }
    }

    fn push_active_list(&self) {
        let event = ServerEvent::ActiveSessions {
            sessions: self.registry.list_active(),
        };
        let frame = match serde_json::to_string(&event) {
            Ok(frame) => frame,
            Err(error) => {
                warn!("failed to serialize event: {error}");
                return;
            }
        };
        for addr in self.connections.values() {
            addr.do_send(Frame(frame.clone()));
        }
    }

    fn subscribe(&mut self, session_id: SessionId, conn: ConnId) {
        self.channels.entry(session_id).or_default().insert(conn);
    }

    // ---- matchmaking -----------------------------------------------------

    fn handle_start_match(&mut self, conn: ConnId, ctx: &mut Context<Self>) {
        if self.queue.contains(conn) || self.registry.is_playing(conn) {
            debug!("{conn} asked to match while already queued or playing");
            return;
        }
        self.queue.enqueue(conn);
        info!("{conn} entered matchmaking (queue depth {})", self.queue.len());
        self.try_pair(ctx);
    }

    fn handle_cancel_match(&mut self, conn: ConnId) {
        if self.queue.cancel(conn) {
            info!("{conn} left matchmaking");
        }
    }

    fn try_pair(&mut self, ctx: &mut Context<Self>) {
        loop {
            let pair = {
                let connections = &self.connections;
                self.queue.take_pair(|conn| connections.contains_key(&conn))
            };
            match pair {
                Some((first, second)) => self.start_session(first, second, ctx),
                None => break,
            }
        }
    }

    fn start_session(&mut self, first: ConnId, second: ConnId, ctx: &mut Context<Self>) {
        let now = Instant::now();
        let white = (Uuid::new_v4(), first);
        let black = (Uuid::new_v4(), second);
        let position = self.rules.new_position();
        let session = self.registry.create(
            white,
            black,
            position,
            self.config.initial_allotment,
            now,
        );
        let session_id = session.id;
        let turn_holder = session.turn_holder;
        let generation = session.maybe_start_clock(now);
        let reading = session.clock.read(now);

        info!(
            "paired session {session_id}: {} (white) vs {} (black)",
            white.0, black.0
        );
        self.channels
            .insert(session_id, HashSet::from([first, second]));

        for (participant, conn, color) in [
            (white.0, first, SideColor::White),
            (black.0, second, SideColor::Black),
        ] {
            self.send_to_conn(
                conn,
                &ServerEvent::SessionStarted {
                    session_id,
                    participant_token: participant,
                    color,
                    turn_holder,
                    white_ms: reading.white_ms(),
                    black_ms: reading.black_ms(),
                },
            );
        }

        if let Some(generation) = generation {
            self.schedule_tick(session_id, generation, ctx);
        }
        self.push_active_list();
    }

    // ---- clock supervision -----------------------------------------------

    fn schedule_tick(&mut self, session_id: SessionId, generation: u64, ctx: &mut Context<Self>) {
        let handle = ctx.run_interval(self.config.tick_interval, move |actor, ctx| {
            actor.on_clock_tick(session_id, generation, ctx);
        });
        if let Some(stale) = self.tick_handles.insert(session_id, handle) {
            ctx.cancel_future(stale);
        }
    }

    fn cancel_tick(&mut self, session_id: SessionId, ctx: &mut Context<Self>) {
        if let Some(handle) = self.tick_handles.remove(&session_id) {
            ctx.cancel_future(handle);
        }
    }

    fn on_clock_tick(&mut self, session_id: SessionId, generation: u64, ctx: &mut Context<Self>) {
        let now = Instant::now();
        let (reading, outcome) = match self.registry.get_mut(&session_id) {
            Some(session) => {
                if session.clock.generation() != generation || !session.clock.is_running() {
                    // superseded by a later start/stop; that owner manages
                    // the schedule now
                    return;
                }
                let reading = session.clock.read(now);
                let outcome = reading.flagged.map(|side| {
                    let outcome = session.timeout_outcome(side);
                    session.end(outcome, now);
                    outcome
                });
                (reading, outcome)
            }
            None => {
                // session reaped under a queued tick: benign race
                self.cancel_tick(session_id, ctx);
                return;
            }
        };

        self.broadcast_session(
            session_id,
            &ServerEvent::ClockUpdate {
                white_ms: reading.white_ms(),
                black_ms: reading.black_ms(),
            },
        );
        if let Some(outcome) = outcome {
            info!("session {session_id} ended on time: {}", outcome.describe());
            self.finish_session(session_id, outcome, ctx);
        }
    }

    /// Common tail of every terminal transition: kill timers, tell the
    /// channel, refresh the lobby list. The session itself stays in the
    /// registry so late rejoin attempts can observe the result; the
    /// janitor reaps it later.
    fn finish_session(&mut self, session_id: SessionId, outcome: MatchOutcome, ctx: &mut Context<Self>) {
        self.cancel_tick(session_id, ctx);
        self.cancel_grace_for_session(session_id, ctx);
        let message = outcome.describe();
        self.broadcast_session(session_id, &ServerEvent::SessionEnded { outcome, message });
        self.push_active_list();
    }

    // ---- moves -----------------------------------------------------------

    fn handle_submit_move(
        &mut self,
        conn: ConnId,
        session_id: SessionId,
        mv: MoveRequest,
        ctx: &mut Context<Self>,
    ) {
        let now = Instant::now();
        let submitter = self
            .registry
            .get(&session_id)
            .and_then(|session| session.participant_by_conn(conn))
            .map(|p| p.id);
        let submitter = match submitter {
            Some(submitter) => submitter,
            None => {
                let message = if self.registry.get(&session_id).is_none() {
                    "session not found"
                } else {
                    "you are not a participant of this session"
                };
                self.send_to_conn(conn, &ServerEvent::Error { message: message.to_string() });
                return;
            }
        };

        let disposition = match self.registry.get_mut(&session_id) {
            Some(session) => session.apply_move(submitter, &mv, self.rules.as_ref(), now),
            None => return,
        };

        match disposition {
            MoveDisposition::Rejected(reason) => {
                warn!("session {session_id}: move from {submitter} rejected: {reason:?}");
                self.send_to_conn(conn, &rejection_event(reason));
            }
            MoveDisposition::Illegal {
                error,
                restart_generation,
            } => {
                self.send_to_conn(
                    conn,
                    &ServerEvent::InvalidMove {
                        mv,
                        message: error.to_string(),
                    },
                );
                if let Some(generation) = restart_generation {
                    self.schedule_tick(session_id, generation, ctx);
                }
            }
            MoveDisposition::Flagged { outcome } => {
                info!("session {session_id}: {}", outcome.describe());
                self.finish_session(session_id, outcome, ctx);
            }
            MoveDisposition::Applied { applied, sequel } => {
                let fen = applied.fen.clone();
                self.broadcast_session(
                    session_id,
                    &ServerEvent::MoveApplied { mv: applied, fen },
                );
                match sequel {
                    Sequel::Over(outcome) => {
                        info!("session {session_id}: {}", outcome.describe());
                        self.finish_session(session_id, outcome, ctx);
                    }
                    Sequel::NextTurn {
                        turn_holder,
                        generation,
                    } => {
                        self.broadcast_session(
                            session_id,
                            &ServerEvent::TurnChanged { turn_holder },
                        );
                        if let Some(generation) = generation {
                            self.schedule_tick(session_id, generation, ctx);
                        }
                    }
                }
            }
        }
    }

    // ---- disconnect / reconnect ------------------------------------------

    fn handle_disconnect(&mut self, conn: ConnId, ctx: &mut Context<Self>) {
        self.connections.remove(&conn);
        self.queue.cancel(conn);
        for subscribers in self.channels.values_mut() {
            subscribers.remove(&conn);
        }

        let session_id = match self.registry.find_session_of_conn(conn) {
            Some(session_id) => session_id,
            None => {
                debug!("socket {conn} closed (not in a session)");
                return;
            }
        };

        let now = Instant::now();
        let note = match self.registry.get_mut(&session_id) {
            Some(session) => session.note_disconnect(conn, now),
            None => return,
        };
        match note {
            DisconnectNote::WentDark {
                participant,
                opponent_conn,
                was_active,
                ..
            } => {
                info!("participant {participant} went dark in session {session_id}");
                if was_active {
                    self.cancel_tick(session_id, ctx);
                    if let Some(opponent_conn) = opponent_conn {
                        self.send_to_conn(
                            opponent_conn,
                            &ServerEvent::OpponentDisconnected {
                                participant_id: participant,
                            },
                        );
                    }
                    self.schedule_grace(session_id, participant, ctx);
                    self.push_active_list();
                }
            }
            DisconnectNote::Ignored => {}
        }
    }

    fn schedule_grace(&mut self, session_id: SessionId, participant: ParticipantId, ctx: &mut Context<Self>) {
        if self.grace_handles.contains_key(&(session_id, participant)) {
            // one timer per disconnected participant, ever
            return;
        }
        let handle = ctx.run_later(self.config.grace_period, move |actor, ctx| {
            actor.on_grace_expired(session_id, participant, ctx);
        });
        self.grace_handles.insert((session_id, participant), handle);
    }

    fn cancel_grace(&mut self, session_id: SessionId, participant: ParticipantId, ctx: &mut Context<Self>) {
        if let Some(handle) = self.grace_handles.remove(&(session_id, participant)) {
            ctx.cancel_future(handle);
        }
    }

    fn cancel_grace_for_session(&mut self, session_id: SessionId, ctx: &mut Context<Self>) {
        let keys: Vec<_> = self
            .grace_handles
            .keys()
            .filter(|(sid, _)| *sid == session_id)
            .copied()
            .collect();
        for key in keys {
            if let Some(handle) = self.grace_handles.remove(&key) {
                ctx.cancel_future(handle);
            }
        }
    }

    fn on_grace_expired(&mut self, session_id: SessionId, participant: ParticipantId, ctx: &mut Context<Self>) {
        self.grace_handles.remove(&(session_id, participant));
        let now = Instant::now();
        // re-validate everything; the world may have moved on
        let outcome = self
            .registry
            .get_mut(&session_id)
            .and_then(|session| session.forfeit_abandoned(participant, now));
        match outcome {
            Some(outcome) => {
                info!("session {session_id}: {}", outcome.describe());
                self.finish_session(session_id, outcome, ctx);
            }
            None => debug!("stale grace timer for {participant} in session {session_id}"),
        }
    }

    fn handle_rejoin(
        &mut self,
        conn: ConnId,
        session_id: SessionId,
        token: ParticipantId,
        ctx: &mut Context<Self>,
    ) {
        let now = Instant::now();

        enum Path {
            Duplicate,
            Late,
            InTime,
        }
        let path = {
            let session = match self.registry.get(&session_id) {
                Some(session) => session,
                None => {
                    self.send_to_conn(
                        conn,
                        &ServerEvent::RejoinFailed {
                            reason: RejoinFailure::SessionNotFound,
                            message: "session not found or already cleaned up".to_string(),
                        },
                    );
                    return;
                }
            };
            match session.participant(token).map(|p| p.presence) {
                None => {
                    self.send_to_conn(
                        conn,
                        &ServerEvent::RejoinFailed {
                            reason: RejoinFailure::InvalidToken,
                            message: "unknown participant token".to_string(),
                        },
                    );
                    return;
                }
                Some(Presence::Connected) => Path::Duplicate,
                Some(Presence::Disconnected { .. }) => {
                    // Late either because the stamp says so or because the
                    // grace timer already fired and forfeited this token.
                    // Other endings (checkmate, timeout, draw) stay
                    // observable to a late rejoiner.
                    let forfeited = matches!(
                        session.outcome(),
                        Some(MatchOutcome::Win {
                            loser,
                            reason: WinReason::Abandoned,
                            ..
                        }) if loser == token
                    );
                    if forfeited
                        || (session.is_active()
                            && session.grace_expired(token, self.config.grace_period, now))
                    {
                        Path::Late
                    } else {
                        Path::InTime
                    }
                }
            }
        };

        match path {
            Path::Late => {
                // the rejoin request itself discovered the expiry; it
                // performs the forfeiture and is the one path that
                // destroys the session synchronously
                self.send_to_conn(
                    conn,
                    &ServerEvent::RejoinFailed {
                        reason: RejoinFailure::GraceExpired,
                        message: "the reconnect window has expired".to_string(),
                    },
                );
                let outcome = self
                    .registry
                    .get_mut(&session_id)
                    .and_then(|session| session.forfeit_abandoned(token, now));
                if let Some(outcome) = outcome {
                    info!("session {session_id}: {}", outcome.describe());
                    self.finish_session(session_id, outcome, ctx);
                }
                self.destroy_session(session_id, ctx);
            }
            Path::Duplicate => {
                // e.g. a page refresh racing a still-valid link: adopt
                // the new transport, tell only the requester
                if let Some(session) = self.registry.get_mut(&session_id) {
                    session.mark_connected(token, conn, now);
                }
                self.subscribe(session_id, conn);
                if let Some(event) = self.rejoined_event(session_id, token, now) {
                    self.send_to_conn(conn, &event);
                }
            }
            Path::InTime => {
                self.cancel_grace(session_id, token, ctx);
                let mut opponent = None;
                let mut generation = None;
                if let Some(session) = self.registry.get_mut(&session_id) {
                    session.mark_connected(token, conn, now);
                    opponent = session
                        .opponent_of(token)
                        .filter(|p| p.is_connected())
                        .map(|p| p.conn);
                    generation = session.maybe_start_clock(now);
                }
                self.subscribe(session_id, conn);
                info!("participant {token} rejoined session {session_id}");
                if let Some(event) = self.rejoined_event(session_id, token, now) {
                    self.send_to_conn(conn, &event);
                }
                if let Some(opponent_conn) = opponent {
                    self.send_to_conn(
                        opponent_conn,
                        &ServerEvent::OpponentReconnected {
                            participant_id: token,
                        },
                    );
                }
                if let Some(generation) = generation {
                    self.schedule_tick(session_id, generation, ctx);
                }
                self.push_active_list();
            }
        }
    }

    fn rejoined_event(
        &self,
        session_id: SessionId,
        token: ParticipantId,
        now: Instant,
    ) -> Option<ServerEvent> {
        let session = self.registry.get(&session_id)?;
        let participant = session.participant(token)?;
        let reading = session.clock.read(now);
        Some(ServerEvent::SessionRejoined {
            session_id,
            participant_token: token,
            color: participant.color,
            turn_holder: session.turn_holder,
            fen: self.rules.fen(&session.position),
            history: session.history.clone(),
            white_ms: reading.white_ms(),
            black_ms: reading.black_ms(),
            opponent_connected: session
                .opponent_of(token)
                .map(|p| p.is_connected())
                .unwrap_or(false),
            outcome: session.outcome(),
        })
    }

    // ---- spectating, listing, chat ---------------------------------------

    fn handle_spectate(&mut self, conn: ConnId, session_id: SessionId) {
        let event = match self.spectate_event(session_id) {
            Some(event) => event,
            None => {
                self.send_to_conn(
                    conn,
                    &ServerEvent::SpectateFailed {
                        message: "session not found".to_string(),
                    },
                );
                return;
            }
        };
        self.subscribe(session_id, conn);
        info!("spectator {conn} joined session {session_id}");
        self.send_to_conn(conn, &event);
    }

    fn spectate_event(&self, session_id: SessionId) -> Option<ServerEvent> {
        let session = self.registry.get(&session_id)?;
        let reading = session.clock.read(Instant::now());
        Some(ServerEvent::SpectateStarted {
            session_id,
            fen: self.rules.fen(&session.position),
            history: session.history.clone(),
            turn_holder: session.turn_holder,
            white_ms: reading.white_ms(),
            black_ms: reading.black_ms(),
        })
    }

    /// Stateless relay to the connected opponent; the server keeps nothing.
    fn handle_chat(&self, conn: ConnId, session_id: SessionId, message: String) {
        let session = match self.registry.get(&session_id) {
            Some(session) => session,
            None => return,
        };
        let sender = match session.participant_by_conn(conn) {
            Some(sender) => sender.id,
            None => return,
        };
        if let Some(opponent) = session.opponent_of(sender).filter(|p| p.is_connected()) {
            self.send_to_conn(opponent.conn, &ServerEvent::Chat { from: sender, message });
        }
    }

    // ---- janitor ---------------------------------------------------------

    fn sweep(&mut self, ctx: &mut Context<Self>) {
        let now = Instant::now();
        let mut finished = Vec::new();
        let mut stuck = Vec::new();
        for (id, session) in self.registry.iter() {
            if !session.all_disconnected() {
                continue;
            }
            let idle = now.saturating_duration_since(session.last_activity);
            if session.outcome().is_some() {
                if idle >= self.config.ended_cooldown {
                    finished.push(*id);
                }
            } else if idle >= self.config.stuck_threshold {
                stuck.push(*id);
            }
        }

        for session_id in stuck {
            // a reconnect timer was somehow lost; end the match before
            // reclaiming it
            warn!("reaping stuck session {session_id}");
            let outcome = MatchOutcome::Draw {
                reason: DrawReason::Abandoned,
            };
            if let Some(session) = self.registry.get_mut(&session_id) {
                session.end(outcome, now);
            }
            self.finish_session(session_id, outcome, ctx);
            self.destroy_session(session_id, ctx);
        }
        for session_id in finished {
            info!("reaping finished session {session_id}");
            self.destroy_session(session_id, ctx);
        }
    }

    /// Cancels every timer referencing the session before removal, so no
    /// dangling callback can outlive it.
    fn destroy_session(&mut self, session_id: SessionId, ctx: &mut Context<Self>) {
        self.cancel_tick(session_id, ctx);
        self.cancel_grace_for_session(session_id, ctx);
        self.channels.remove(&session_id);
        if self.registry.remove(&session_id).is_some() {
            info!("destroyed session {session_id}");
        }
    }
}

fn rejection_event(reason: RejectReason) -> ServerEvent {
    match reason {
        RejectReason::SessionOver => ServerEvent::Error {
            message: "the session is already over".to_string(),
        },
        RejectReason::NotAParticipant => ServerEvent::Error {
            message: "you are not a participant of this session".to_string(),
        },
        RejectReason::NotYourTurn => ServerEvent::Error {
            message: "it is not your turn".to_string(),
        },
        RejectReason::OpponentUnreachable => ServerEvent::OpponentUnreachable {
            message: "your opponent is temporarily disconnected; please wait".to_string(),
        },
    }
}

impl Actor for MatchServer {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            "match server up (allotment {:?}, grace {:?}, janitor every {:?})",
            self.config.initial_allotment, self.config.grace_period, self.config.janitor_period
        );
        ctx.run_interval(self.config.janitor_period, |actor, ctx| actor.sweep(ctx));
    }
}

impl Handler<Connect> for MatchServer {
    type Result = ();

    fn handle(&mut self, msg: Connect, _: &mut Context<Self>) {
        self.connections.insert(msg.conn, msg.addr);
        info!(
            "socket {} registered ({} open)",
            msg.conn,
            self.connections.len()
        );
    }
}

impl Handler<Disconnect> for MatchServer {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, ctx: &mut Context<Self>) {
        self.handle_disconnect(msg.conn, ctx);
    }
}

impl Handler<Inbound> for MatchServer {
    type Result = ();

    fn handle(&mut self, msg: Inbound, ctx: &mut Context<Self>) {
        let Inbound { conn, intent } = msg;
        match intent {
            ClientIntent::StartMatch => self.handle_start_match(conn, ctx),
            ClientIntent::CancelMatch => self.handle_cancel_match(conn),
            ClientIntent::SubmitMove { session_id, mv } => {
                self.handle_submit_move(conn, session_id, mv, ctx)
            }
            ClientIntent::Rejoin {
                session_id,
                participant_token,
            } => self.handle_rejoin(conn, session_id, participant_token, ctx),
            ClientIntent::Spectate { session_id } => self.handle_spectate(conn, session_id),
            ClientIntent::ListActiveSessions => self.send_to_conn(
                conn,
                &ServerEvent::ActiveSessions {
                    sessions: self.registry.list_active(),
                },
            ),
            ClientIntent::Chat { session_id, message } => {
                self.handle_chat(conn, session_id, message)
            }
        }
    }
}
