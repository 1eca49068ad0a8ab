#![forbid(unsafe_code)]

//! Pure session lifecycle state machine, decoupled from the QUIC
//! transport so UI layers can drive it and tests can run it without a
//! network.
//!
//! The controller owns the message list for one room and deduplicates
//! by message id, so a reconnect that replays history over already
//! delivered messages never shows duplicates.

use std::collections::HashSet;
use std::time::Duration;

use casechat_domain::{ChatMessage, ChatRoom, Identity, MessageId};

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Session lifecycle phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
	/// No transport; a connect has not been requested yet.
	Disconnected,
	/// Transport dial in progress.
	Connecting,
	/// Transport is up, credentials sent, waiting for the verdict.
	Authenticating,
	/// Authenticated, waiting for the document's room to resolve.
	ResolvingRoom,
	/// Room resolved, join sent, waiting for the history snapshot.
	Joining,
	/// Live: history loaded, receiving broadcasts.
	Active,
	/// Terminal. Entered when the user closes the view or when the
	/// server rejects the credentials.
	Closed,
}

/// Inputs fed to the controller by the transport and the UI.
#[derive(Debug, Clone)]
pub enum SessionInput {
	ConnectRequested,
	TransportUp,
	AuthAccepted(Identity),
	AuthRejected(String),
	RoomResolved(ChatRoom),
	HistoryLoaded(Vec<ChatMessage>),
	MessageReceived(ChatMessage),
	TransportLost,
	ViewClosed,
}

/// What the embedding layer should do after an input was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
	None,
	/// Dial the server, authenticate, resolve and join.
	Dial,
	/// Wait `after`, then feed `ConnectRequested` again.
	RetryAfter(Duration),
	/// Stop; show `reason` if present.
	Shutdown(Option<String>),
}

pub struct SessionController {
	phase: SessionPhase,
	identity: Option<Identity>,
	room: Option<ChatRoom>,
	messages: Vec<ChatMessage>,
	seen: HashSet<MessageId>,
	retry_delay: Duration,
}

impl Default for SessionController {
	fn default() -> Self {
		Self::new()
	}
}

impl SessionController {
	pub fn new() -> Self {
		Self {
			phase: SessionPhase::Disconnected,
			identity: None,
			room: None,
			messages: Vec::new(),
			seen: HashSet::new(),
			retry_delay: INITIAL_RETRY_DELAY,
		}
	}

	pub fn phase(&self) -> &SessionPhase {
		&self.phase
	}

	pub fn identity(&self) -> Option<&Identity> {
		self.identity.as_ref()
	}

	pub fn room(&self) -> Option<&ChatRoom> {
		self.room.as_ref()
	}

	/// Messages in ascending id order.
	pub fn messages(&self) -> &[ChatMessage] {
		&self.messages
	}

	/// Apply one input; returns the action the embedding layer should take.
	pub fn handle(&mut self, input: SessionInput) -> SessionAction {
		use SessionInput::*;
		use SessionPhase::*;

		match (&self.phase, input) {
			(_, ViewClosed) => {
				self.phase = Closed;
				SessionAction::Shutdown(None)
			}
			(Closed, _) => SessionAction::None,

			(Disconnected, ConnectRequested) | (Connecting, ConnectRequested) => {
				self.phase = Connecting;
				SessionAction::Dial
			}
			(Connecting, TransportUp) => {
				self.phase = Authenticating;
				SessionAction::None
			}
			(Authenticating, AuthAccepted(identity)) => {
				self.identity = Some(identity);
				self.retry_delay = INITIAL_RETRY_DELAY;
				self.phase = ResolvingRoom;
				SessionAction::None
			}
			// Bad credentials will not get better by retrying.
			(Authenticating, AuthRejected(reason)) => {
				self.phase = Closed;
				SessionAction::Shutdown(Some(reason))
			}
			(ResolvingRoom, RoomResolved(room)) => {
				self.room = Some(room);
				self.phase = Joining;
				SessionAction::None
			}
			(Joining, HistoryLoaded(history)) => {
				for message in history {
					self.absorb(message);
				}
				self.phase = Active;
				SessionAction::None
			}
			(Active, MessageReceived(message)) => {
				self.absorb(message);
				SessionAction::None
			}
			// Broadcasts can race the history snapshot on the wire only
			// through client-side buffering; absorb them anywhere past join.
			(Joining, MessageReceived(message)) => {
				self.absorb(message);
				SessionAction::None
			}
			(Connecting | Authenticating | ResolvingRoom | Joining | Active, TransportLost) => {
				let delay = self.retry_delay;
				self.retry_delay = (self.retry_delay * 2).min(MAX_RETRY_DELAY);
				self.phase = Connecting;
				SessionAction::RetryAfter(delay)
			}
			(_, _) => SessionAction::None,
		}
	}

	fn absorb(&mut self, message: ChatMessage) {
		if !self.seen.insert(message.id) {
			return;
		}
		let at = self.messages.partition_point(|m| m.id < message.id);
		self.messages.insert(at, message);
	}
}

#[cfg(test)]
mod tests {
	use casechat_domain::{DocumentId, NewMessage, Role, RoomId, UserId};

	use super::*;

	fn identity() -> Identity {
		Identity {
			user_id: UserId::new("dealer-1").unwrap(),
			name: "Dealer One".to_string(),
			role: Role::Dealer,
		}
	}

	fn room() -> ChatRoom {
		ChatRoom {
			id: RoomId(7),
			document_id: DocumentId(41),
			dealer_participant_id: UserId::new("dealer-1").unwrap(),
			worker_participant_id: None,
			created_at_unix_ms: 1_000,
		}
	}

	fn message(id: u64, text: &str) -> ChatMessage {
		let new = NewMessage::user(&identity(), text.to_string(), 2_000 + id as i64);
		ChatMessage {
			id: MessageId(id),
			room_id: RoomId(7),
			sender_id: new.sender_id,
			sender_role: new.sender_role,
			sender_name: new.sender_name,
			text: new.text,
			kind: new.kind,
			created_at_unix_ms: new.created_at_unix_ms,
		}
	}

	fn bring_to_active(c: &mut SessionController, history: Vec<ChatMessage>) {
		assert_eq!(c.handle(SessionInput::ConnectRequested), SessionAction::Dial);
		assert_eq!(c.handle(SessionInput::TransportUp), SessionAction::None);
		assert_eq!(c.handle(SessionInput::AuthAccepted(identity())), SessionAction::None);
		assert_eq!(c.handle(SessionInput::RoomResolved(room())), SessionAction::None);
		assert_eq!(c.handle(SessionInput::HistoryLoaded(history)), SessionAction::None);
		assert_eq!(c.phase(), &SessionPhase::Active);
	}

	#[test]
	fn happy_path_reaches_active() {
		let mut c = SessionController::new();
		bring_to_active(&mut c, vec![message(1, "hello")]);

		assert_eq!(c.identity().unwrap().name, "Dealer One");
		assert_eq!(c.room().unwrap().id, RoomId(7));
		assert_eq!(c.messages().len(), 1);
	}

	#[test]
	fn reconnect_history_replay_does_not_duplicate() {
		let mut c = SessionController::new();
		bring_to_active(&mut c, vec![message(1, "a"), message(2, "b")]);
		c.handle(SessionInput::MessageReceived(message(3, "c")));

		// Connection drops; the next history snapshot overlaps everything
		// already shown plus one new message sent while offline.
		assert!(matches!(c.handle(SessionInput::TransportLost), SessionAction::RetryAfter(_)));
		assert_eq!(c.handle(SessionInput::ConnectRequested), SessionAction::Dial);
		c.handle(SessionInput::TransportUp);
		c.handle(SessionInput::AuthAccepted(identity()));
		c.handle(SessionInput::RoomResolved(room()));
		c.handle(SessionInput::HistoryLoaded(vec![
			message(1, "a"),
			message(2, "b"),
			message(3, "c"),
			message(4, "d"),
		]));

		let ids: Vec<u64> = c.messages().iter().map(|m| m.id.as_u64()).collect();
		assert_eq!(ids, vec![1, 2, 3, 4]);
	}

	#[test]
	fn retry_delay_doubles_caps_and_resets_on_auth() {
		let mut c = SessionController::new();
		c.handle(SessionInput::ConnectRequested);

		let mut last = Duration::ZERO;
		for _ in 0..12 {
			match c.handle(SessionInput::TransportLost) {
				SessionAction::RetryAfter(d) => {
					assert!(d >= last);
					assert!(d <= MAX_RETRY_DELAY);
					last = d;
				}
				other => panic!("expected retry, got {other:?}"),
			}
			c.handle(SessionInput::ConnectRequested);
		}
		assert_eq!(last, MAX_RETRY_DELAY);

		// A successful auth resets the backoff.
		c.handle(SessionInput::TransportUp);
		c.handle(SessionInput::AuthAccepted(identity()));
		match c.handle(SessionInput::TransportLost) {
			SessionAction::RetryAfter(d) => assert_eq!(d, INITIAL_RETRY_DELAY),
			other => panic!("expected retry, got {other:?}"),
		}
	}

	#[test]
	fn rejected_credentials_are_terminal() {
		let mut c = SessionController::new();
		c.handle(SessionInput::ConnectRequested);
		c.handle(SessionInput::TransportUp);

		let action = c.handle(SessionInput::AuthRejected("expired token".to_string()));
		assert_eq!(action, SessionAction::Shutdown(Some("expired token".to_string())));
		assert_eq!(c.phase(), &SessionPhase::Closed);

		// No further input moves a closed session.
		assert_eq!(c.handle(SessionInput::ConnectRequested), SessionAction::None);
		assert_eq!(c.phase(), &SessionPhase::Closed);
	}

	#[test]
	fn messages_survive_transport_loss() {
		let mut c = SessionController::new();
		bring_to_active(&mut c, vec![message(1, "kept")]);
		c.handle(SessionInput::TransportLost);
		assert_eq!(c.phase(), &SessionPhase::Connecting);
		assert_eq!(c.messages().len(), 1);
	}
}
