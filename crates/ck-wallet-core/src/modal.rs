use alloy_primitives::Address;
use ck_api_types::{ChainId, WalletId};
use ck_connectors::{ConnectParams, Connector, ConnectorError, LOCAL_WALLET_SLOT, WrapperKind, WrapperWallet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::session::same_connector;
use crate::{
    AccountSnapshot, ActionKind, ConnectConfig, ConnectionSession, RegistryError, ScreenAction, ScreenView,
    WalletDescriptor, WalletKind, WalletRegistry, render,
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screen {
    WalletList,
    /// Where to get a wallet that is not installed.
    GetStarted { wallet: WalletId },
    Scan { wallet: WalletId, uri: String },
    Connecting { wallet: WalletId },
    SelectPersonalWallet { wrapper: WalletId },
    WrapperForm { wrapper: WalletId, personal: WalletId },
    LocalWallet { wallet: WalletId, has_saved: bool, error: Option<String> },
    EmbeddedEmail { wallet: WalletId, error: Option<String> },
    EmbeddedOtp { wallet: WalletId, email: String, error: Option<String> },
    Closed,
}

impl Screen {
    /// Same screen with `error` shown, for screens that have an error slot.
    fn with_error(self, error: &ConnectorError) -> Self {
        let message = Some(error.to_string());
        match self {
            Self::LocalWallet { wallet, has_saved, .. } => Self::LocalWallet {
                wallet,
                has_saved,
                error: message,
            },
            Self::EmbeddedEmail { wallet, .. } => Self::EmbeddedEmail { wallet, error: message },
            Self::EmbeddedOtp { wallet, email, .. } => Self::EmbeddedOtp {
                wallet,
                email,
                error: message,
            },
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModalEvent {
    ScreenChanged(Screen),
    Connected(AccountSnapshot),
    Failed { wallet: WalletId, error: ConnectorError },
    Closed,
}

/// What a user action led to. Wallet failures are outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    Connected(Address),
    Failed(ConnectorError),
    /// The modal moved to a screen that needs more input.
    AwaitingInput,
    /// The wallet's app was opened through a deep link.
    Redirected,
    /// The wallet is already being connected.
    Ignored,
    /// A later selection replaced this attempt.
    Superseded,
    /// The modal was closed or navigated away from before the wallet answered.
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum ModalError {
    #[error("the connect modal is closed")]
    Closed,
    #[error("unknown wallet: {0}")]
    UnknownWallet(WalletId),
    #[error("{0:?} is not available on this screen")]
    InvalidAction(ActionKind),
    #[error(transparent)]
    Registry(RegistryError),
}

impl From<RegistryError> for ModalError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownWallet(wallet) => Self::UnknownWallet(wallet),
            other => Self::Registry(other),
        }
    }
}

#[derive(Debug, Clone)]
enum Role {
    /// The wallet the user picked; activated on success.
    Direct,
    /// Owner of a wrapper account; success leads to the wrapper form.
    Personal { wrapper: WalletId },
    /// The wrapper itself, after its personal wallet connected.
    Wrapper,
}

struct Attempt {
    token: u64,
    wallet_id: WalletId,
    connector: Arc<dyn Connector>,
    role: Role,
    /// Where a failure sends the user.
    on_error: Screen,
    /// Set to what the abandoned attempt reports once it notices.
    abandoned: watch::Sender<Option<SelectOutcome>>,
}

enum Step {
    Done(SelectOutcome),
    SubmitWrapper,
}

struct ModalState {
    screen: Screen,
    next_token: u64,
    attempt: Option<Attempt>,
    /// Set while the user is picking or has picked the personal wallet of
    /// this wrapper.
    wrapper: Option<WalletId>,
    /// Connected personal wallet waiting for the wrapper form.
    pending_personal: Option<(WalletId, Arc<dyn Connector>)>,
    last_error: Option<ConnectorError>,
}

struct ModalInner {
    registry: Arc<WalletRegistry>,
    session: ConnectionSession,
    config: ConnectConfig,
    state: Mutex<ModalState>,
    events: broadcast::Sender<ModalEvent>,
}

impl ModalInner {
    fn lock(&self) -> MutexGuard<'_, ModalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_screen(&self, state: &mut ModalState, screen: Screen) {
        if state.screen == screen {
            return;
        }
        debug!(from = ?state.screen, to = ?screen, "screen changed");
        state.screen = screen.clone();
        let closed = screen == Screen::Closed;
        let _ = self.events.send(ModalEvent::ScreenChanged(screen));
        if closed {
            let _ = self.events.send(ModalEvent::Closed);
        }
    }
}

/// The connect modal: which screen is shown, and the one connection attempt
/// that may be in flight.
///
/// Every attempt gets a token. A result whose token is no longer current is
/// dropped, which is how selecting another wallet, going back, or closing
/// the modal wins over a wallet that answers late. The connector of an
/// abandoned attempt is disconnected exactly once.
#[derive(Clone)]
pub struct ConnectModal {
    inner: Arc<ModalInner>,
}

impl ConnectModal {
    pub fn new(registry: Arc<WalletRegistry>, session: ConnectionSession, config: ConnectConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ModalInner {
                registry,
                session,
                config,
                state: Mutex::new(ModalState {
                    screen: Screen::Closed,
                    next_token: 0,
                    attempt: None,
                    wrapper: None,
                    pending_personal: None,
                    last_error: None,
                }),
                events,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<WalletRegistry> {
        &self.inner.registry
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.inner.session
    }

    pub fn screen(&self) -> Screen {
        self.inner.lock().screen.clone()
    }

    pub fn view(&self) -> ScreenView {
        render(&self.screen(), &self.inner.registry)
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().screen != Screen::Closed
    }

    pub fn last_error(&self) -> Option<ConnectorError> {
        self.inner.lock().last_error.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModalEvent> {
        self.inner.events.subscribe()
    }

    pub fn open(&self) {
        let mut state = self.inner.lock();
        if state.screen == Screen::Closed {
            state.last_error = None;
            self.inner.set_screen(&mut state, Screen::WalletList);
        }
    }

    /// Closes the modal and abandons whatever is in flight.
    pub async fn close(&self) {
        let (attempt, pending) = {
            let mut state = self.inner.lock();
            if state.screen == Screen::Closed {
                return;
            }
            state.wrapper = None;
            let attempt = state.attempt.take();
            let pending = state.pending_personal.take();
            self.inner.set_screen(&mut state, Screen::Closed);
            (attempt, pending)
        };
        info!(abandoned = attempt.is_some(), "connect modal closed");
        self.abandon(attempt, pending, SelectOutcome::Cancelled).await;
    }

    pub async fn back(&self) -> Result<(), ModalError> {
        let (attempt, pending) = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            let next = match &state.screen {
                Screen::Closed => return Err(ModalError::Closed),
                Screen::WalletList => return Err(ModalError::InvalidAction(ActionKind::Back)),
                Screen::SelectPersonalWallet { .. } => {
                    state.wrapper = None;
                    Screen::WalletList
                }
                Screen::EmbeddedOtp { wallet, .. } => Screen::EmbeddedEmail {
                    wallet: wallet.clone(),
                    error: None,
                },
                _ => match &state.wrapper {
                    Some(wrapper) => Screen::SelectPersonalWallet {
                        wrapper: wrapper.clone(),
                    },
                    None => Screen::WalletList,
                },
            };
            let attempt = state.attempt.take();
            let pending = state.pending_personal.take();
            self.inner.set_screen(state, next);
            (attempt, pending)
        };
        self.abandon(attempt, pending, SelectOutcome::Cancelled).await;
        Ok(())
    }

    /// Handles a wallet picked from the list (or from the personal wallet
    /// list inside a wrapper flow).
    pub async fn select_wallet(&self, wallet: impl Into<WalletId>) -> Result<SelectOutcome, ModalError> {
        let wallet = wallet.into();
        let registry = self.inner.registry.clone();
        let descriptor = registry.descriptor(&wallet)?;

        let wrapper = {
            let state = self.inner.lock();
            match &state.screen {
                Screen::Closed => return Err(ModalError::Closed),
                Screen::WalletList
                | Screen::SelectPersonalWallet { .. }
                | Screen::GetStarted { .. }
                | Screen::Scan { .. }
                | Screen::Connecting { .. } => {}
                _ => return Err(ModalError::InvalidAction(ActionKind::SelectWallet)),
            }
            if state.attempt.as_ref().is_some_and(|attempt| attempt.wallet_id == wallet) {
                debug!(wallet = %wallet, "already connecting, selection ignored");
                return Ok(SelectOutcome::Ignored);
            }
            state.wrapper.clone()
        };
        let (role, on_error) = match &wrapper {
            Some(wrapper) => (
                Role::Personal {
                    wrapper: wrapper.clone(),
                },
                Screen::SelectPersonalWallet {
                    wrapper: wrapper.clone(),
                },
            ),
            None => (Role::Direct, Screen::WalletList),
        };
        info!(wallet = %wallet, wrapper = ?wrapper, "wallet selected");

        if wrapper.is_some() && !matches!(descriptor.kind, WalletKind::Wrapper(_)) {
            if let Some(connector) = self.live_connector(&wallet).await {
                debug!(wallet = %wallet, "personal wallet already backs the session, reused");
                let (token, abandoned) = self.begin_attempt(wallet, connector.clone(), role, on_error).await;
                let result = connector.address().await;
                let reason = abandoned.borrow().clone();
                let step = self.finish(token, result, reason).await?;
                return self.drive(step).await;
            }
        }

        let step = match descriptor.kind {
            WalletKind::Wrapper(_) if wrapper.is_some() => {
                return Err(ModalError::InvalidAction(ActionKind::SelectWallet));
            }
            WalletKind::Wrapper(_) => {
                self.cancel_attempt().await;
                let mut state = self.inner.lock();
                state.wrapper = Some(wallet.clone());
                self.inner
                    .set_screen(&mut state, Screen::SelectPersonalWallet { wrapper: wallet });
                return Ok(SelectOutcome::AwaitingInput);
            }
            // Inside a wrapper flow the guest wallet is ephemeral and connects
            // right away.
            WalletKind::Local if wrapper.is_some() => {
                let connector = registry.connector(&wallet)?;
                self.run_connect(wallet, connector, role, on_error, ConnectParams::default(), true)
                    .await?
            }
            WalletKind::Local => {
                self.cancel_attempt().await;
                let has_saved = self.has_saved_guest().await;
                self.show(Screen::LocalWallet {
                    wallet,
                    has_saved,
                    error: None,
                });
                return Ok(SelectOutcome::AwaitingInput);
            }
            WalletKind::Embedded => {
                self.cancel_attempt().await;
                self.show(Screen::EmbeddedEmail { wallet, error: None });
                return Ok(SelectOutcome::AwaitingInput);
            }
            WalletKind::Qr => {
                let connector = registry.connector(&wallet)?;
                self.run_pairing(wallet, connector, role, on_error).await?
            }
            WalletKind::Injected(_) if registry.is_installed(descriptor) => {
                let connector = registry.connector(&wallet)?;
                self.run_connect(wallet, connector, role, on_error, ConnectParams::default(), true)
                    .await?
            }
            WalletKind::Injected(_) if self.is_mobile() => return Ok(self.open_in_wallet_app(descriptor).await),
            WalletKind::Injected(_) if descriptor.has_pairing() => {
                let connector = registry.pairing_connector(&wallet)?;
                self.run_pairing(wallet, connector, role, on_error).await?
            }
            WalletKind::Injected(_) => {
                self.cancel_attempt().await;
                self.show(Screen::GetStarted { wallet });
                return Ok(SelectOutcome::AwaitingInput);
            }
        };
        self.drive(step).await
    }

    /// Connects the wrapper wallet on top of the personal wallet picked
    /// before. Safe needs its contract address; Smart Wallet needs nothing
    /// and is submitted automatically.
    pub async fn submit_wrapper_form(
        &self,
        safe_address: Option<Address>,
        chain_id: Option<ChainId>,
    ) -> Result<SelectOutcome, ModalError> {
        let (wrapper, personal_id, personal) = {
            let mut state = self.inner.lock();
            let wrapper = match &state.screen {
                Screen::WrapperForm { wrapper, .. } => wrapper.clone(),
                Screen::Closed => return Err(ModalError::Closed),
                _ => return Err(ModalError::InvalidAction(ActionKind::SubmitWrapperForm)),
            };
            if state.attempt.as_ref().is_some_and(|attempt| attempt.wallet_id == wrapper) {
                return Ok(SelectOutcome::Ignored);
            }
            // The wrapper owns the personal wallet from here on.
            let Some((personal_id, personal)) = state.pending_personal.take() else {
                return Err(ModalError::InvalidAction(ActionKind::SubmitWrapperForm));
            };
            (wrapper, personal_id, personal)
        };

        let connector = self.inner.registry.connector(&wrapper)?;
        let Some(wrapper_wallet) = connector.as_wrapper() else {
            self.release(&personal_id, &personal).await;
            return Err(RegistryError::NotConfigured {
                wallet: wrapper,
                reason: "not a wrapper wallet".to_owned(),
            }
            .into());
        };
        let replaced = wrapper_wallet
            .set_personal_wallet(personal.clone())
            .filter(|replaced| !same_connector(replaced, &personal));

        let params = ConnectParams {
            chain_id,
            safe_address,
            ..ConnectParams::default()
        };
        let on_error = Screen::SelectPersonalWallet {
            wrapper: wrapper.clone(),
        };
        let outcome = match self
            .run_connect(wrapper, connector.clone(), Role::Wrapper, on_error, params, true)
            .await?
        {
            Step::Done(outcome) => outcome,
            Step::SubmitWrapper => SelectOutcome::AwaitingInput,
        };

        if let Some(replaced) = replaced {
            self.settle_replaced_personal(&connector, wrapper_wallet, replaced, &personal_id, &personal, &outcome)
                .await;
        }
        Ok(outcome)
    }

    /// Deals with the personal wallet a wrapper ran on before this submit.
    /// A wrapper that is still live after a failed submit goes back to it.
    async fn settle_replaced_personal(
        &self,
        wrapper: &Arc<dyn Connector>,
        wrapper_wallet: &dyn WrapperWallet,
        replaced: Arc<dyn Connector>,
        personal_id: &WalletId,
        personal: &Arc<dyn Connector>,
        outcome: &SelectOutcome,
    ) {
        let replaced_id = WalletId::from(replaced.id());
        if !matches!(outcome, SelectOutcome::Connected(_)) && wrapper.is_connected().await {
            debug!(personal = %replaced_id, "wrapper kept its earlier personal wallet");
            wrapper_wallet.set_personal_wallet(replaced);
            self.release(personal_id, personal).await;
            return;
        }
        self.release(&replaced_id, &replaced).await;
    }

    /// Unlocks or creates the guest wallet. An empty password means an
    /// ephemeral wallet.
    pub async fn submit_local(&self, password: Option<String>) -> Result<SelectOutcome, ModalError> {
        let (wallet, screen) = {
            let state = self.inner.lock();
            match &state.screen {
                Screen::LocalWallet { wallet, .. } => (wallet.clone(), state.screen.clone()),
                Screen::Closed => return Err(ModalError::Closed),
                _ => return Err(ModalError::InvalidAction(ActionKind::SubmitLocal)),
            }
        };
        let connector = self.inner.registry.connector(&wallet)?;
        let params = ConnectParams {
            password: password.filter(|password| !password.is_empty()),
            ..ConnectParams::default()
        };
        let step = self.run_connect(wallet, connector, Role::Direct, screen, params, true).await?;
        self.drive(step).await
    }

    pub async fn submit_email(&self, email: String) -> Result<SelectOutcome, ModalError> {
        let wallet = {
            let state = self.inner.lock();
            match &state.screen {
                Screen::EmbeddedEmail { wallet, .. } => wallet.clone(),
                Screen::Closed => return Err(ModalError::Closed),
                _ => return Err(ModalError::InvalidAction(ActionKind::SubmitEmail)),
            }
        };
        let connector = self.inner.registry.connector(&wallet)?;
        let otp = connector.as_otp().ok_or_else(|| RegistryError::NotConfigured {
            wallet: wallet.clone(),
            reason: "no one-time code login".to_owned(),
        })?;
        let email = email.trim().to_owned();
        let sent = otp.send_otp(&email).await;

        let mut state = self.inner.lock();
        if !matches!(&state.screen, Screen::EmbeddedEmail { wallet: current, .. } if *current == wallet) {
            return Ok(SelectOutcome::Cancelled);
        }
        match sent {
            Ok(()) => {
                info!(wallet = %wallet, "one-time code sent");
                self.inner.set_screen(
                    &mut state,
                    Screen::EmbeddedOtp {
                        wallet,
                        email,
                        error: None,
                    },
                );
                Ok(SelectOutcome::AwaitingInput)
            }
            Err(error) => {
                warn!(wallet = %wallet, %error, "one-time code not sent");
                state.last_error = Some(error.clone());
                let screen = Screen::EmbeddedEmail { wallet, error: None }.with_error(&error);
                self.inner.set_screen(&mut state, screen);
                Ok(SelectOutcome::Failed(error))
            }
        }
    }

    pub async fn submit_otp(&self, otp: String) -> Result<SelectOutcome, ModalError> {
        let (wallet, email, screen, wrapper) = {
            let state = self.inner.lock();
            match &state.screen {
                Screen::EmbeddedOtp { wallet, email, .. } => (
                    wallet.clone(),
                    email.clone(),
                    state.screen.clone(),
                    state.wrapper.clone(),
                ),
                Screen::Closed => return Err(ModalError::Closed),
                _ => return Err(ModalError::InvalidAction(ActionKind::SubmitOtp)),
            }
        };
        let connector = self.inner.registry.connector(&wallet)?;
        let role = match wrapper {
            Some(wrapper) => Role::Personal { wrapper },
            None => Role::Direct,
        };
        let params = ConnectParams {
            email: Some(email),
            otp: Some(otp.trim().to_owned()),
            ..ConnectParams::default()
        };
        let step = self.run_connect(wallet, connector, role, screen, params, true).await?;
        self.drive(step).await
    }

    /// Runs an action coming from a rendered screen. Actions the current
    /// screen does not offer are refused.
    pub async fn dispatch(&self, action: ScreenAction) -> Result<SelectOutcome, ModalError> {
        let screen = self.screen();
        if screen == Screen::Closed {
            return Err(ModalError::Closed);
        }
        if !render(&screen, &self.inner.registry).allows(&action) {
            return Err(ModalError::InvalidAction(action.kind()));
        }

        match action {
            ScreenAction::SelectWallet(wallet) => self.select_wallet(wallet).await,
            ScreenAction::Back => {
                self.back().await?;
                Ok(SelectOutcome::AwaitingInput)
            }
            ScreenAction::Close => {
                self.close().await;
                Ok(SelectOutcome::Cancelled)
            }
            ScreenAction::GetStarted(wallet) => {
                self.inner.registry.descriptor(&wallet)?;
                self.cancel_attempt().await;
                self.show(Screen::GetStarted { wallet });
                Ok(SelectOutcome::AwaitingInput)
            }
            ScreenAction::OpenUrl(url) => match self.inner.registry.environment().open_url(&url) {
                Ok(()) => Ok(SelectOutcome::Redirected),
                Err(error) => Ok(SelectOutcome::Failed(error)),
            },
            ScreenAction::SubmitWrapperForm { safe_address, chain_id } => {
                self.submit_wrapper_form(safe_address, chain_id).await
            }
            ScreenAction::SubmitLocal { password } => self.submit_local(password).await,
            ScreenAction::SubmitEmail { email } => self.submit_email(email).await,
            ScreenAction::SubmitOtp { otp } => self.submit_otp(otp).await,
        }
    }

    fn is_mobile(&self) -> bool {
        self.inner.config.is_mobile || self.inner.registry.environment().is_mobile()
    }

    fn show(&self, screen: Screen) {
        let mut state = self.inner.lock();
        if state.screen != Screen::Closed {
            self.inner.set_screen(&mut state, screen);
        }
    }

    async fn has_saved_guest(&self) -> bool {
        match self.inner.registry.options().keystore.load_encrypted_key(LOCAL_WALLET_SLOT).await {
            Ok(saved) => saved.is_some(),
            Err(err) => {
                warn!(error = %err, "keystore unavailable");
                false
            }
        }
    }

    async fn open_in_wallet_app(&self, descriptor: &WalletDescriptor) -> SelectOutcome {
        self.cancel_attempt().await;
        let dapp_url = &self.inner.registry.options().dapp.url;
        let target = dapp_url.split_once("://").map_or(dapp_url.as_str(), |(_, rest)| rest);
        let Some(prefix) = &descriptor.meta.deep_link else {
            self.show(Screen::GetStarted {
                wallet: descriptor.id.clone(),
            });
            return SelectOutcome::AwaitingInput;
        };

        match self.inner.registry.environment().open_url(&format!("{prefix}{target}")) {
            Ok(()) => {
                info!(wallet = %descriptor.id, "opened wallet app");
                SelectOutcome::Redirected
            }
            Err(error) => {
                warn!(wallet = %descriptor.id, %error, "deep link failed");
                self.show(Screen::GetStarted {
                    wallet: descriptor.id.clone(),
                });
                SelectOutcome::AwaitingInput
            }
        }
    }

    /// The live session's connector, if it belongs to `wallet` and is still
    /// connected.
    async fn live_connector(&self, wallet: &WalletId) -> Option<Arc<dyn Connector>> {
        if self.inner.session.active_wallet().as_ref() != Some(wallet) {
            return None;
        }
        let connector = self.inner.session.active_connector()?;
        connector.is_connected().await.then_some(connector)
    }

    /// Disconnects `connector` unless it backs the live session.
    async fn release(&self, wallet: &WalletId, connector: &Arc<dyn Connector>) {
        let active = self.inner.session.active_connector();
        if active.is_some_and(|active| same_connector(&active, connector)) {
            debug!(wallet = %wallet, "connector backs the active session, kept");
            return;
        }
        if let Err(err) = connector.disconnect().await {
            warn!(wallet = %wallet, error = %err, "disconnect failed");
        }
    }

    async fn abandon(
        &self,
        attempt: Option<Attempt>,
        pending: Option<(WalletId, Arc<dyn Connector>)>,
        outcome: SelectOutcome,
    ) {
        if let Some(attempt) = attempt {
            attempt.abandoned.send_replace(Some(outcome));
            debug!(wallet = %attempt.wallet_id, token = attempt.token, "attempt abandoned");
            self.release(&attempt.wallet_id, &attempt.connector).await;
        }
        if let Some((wallet, connector)) = pending {
            self.release(&wallet, &connector).await;
        }
    }

    async fn cancel_attempt(&self) {
        let attempt = self.inner.lock().attempt.take();
        self.abandon(attempt, None, SelectOutcome::Superseded).await;
    }

    /// Registers a new attempt, abandoning the previous one.
    async fn begin_attempt(
        &self,
        wallet_id: WalletId,
        connector: Arc<dyn Connector>,
        role: Role,
        on_error: Screen,
    ) -> (u64, watch::Receiver<Option<SelectOutcome>>) {
        let (abandoned, watcher) = watch::channel(None);
        let (token, previous) = {
            let mut state = self.inner.lock();
            state.next_token += 1;
            let token = state.next_token;
            let previous = state.attempt.replace(Attempt {
                token,
                wallet_id: wallet_id.clone(),
                connector: connector.clone(),
                role,
                on_error,
                abandoned,
            });
            (token, previous)
        };

        if let Some(previous) = previous {
            info!(previous = %previous.wallet_id, next = %wallet_id, "connection attempt superseded");
            previous.abandoned.send_replace(Some(SelectOutcome::Superseded));
            if !same_connector(&previous.connector, &connector) {
                self.release(&previous.wallet_id, &previous.connector).await;
            }
        }
        (token, watcher)
    }

    async fn run_connect(
        &self,
        wallet: WalletId,
        connector: Arc<dyn Connector>,
        role: Role,
        on_error: Screen,
        params: ConnectParams,
        show_connecting: bool,
    ) -> Result<Step, ModalError> {
        let (token, mut abandoned) = self.begin_attempt(wallet.clone(), connector.clone(), role, on_error).await;
        debug!(wallet = %wallet, token, "connecting");
        let result = self
            .await_connect(token, &wallet, connector, params, &mut abandoned, show_connecting)
            .await;
        let reason = abandoned.borrow().clone();
        self.finish(token, result, reason).await
    }

    /// Shows the pairing URI, then waits for the remote wallet.
    async fn run_pairing(
        &self,
        wallet: WalletId,
        connector: Arc<dyn Connector>,
        role: Role,
        on_error: Screen,
    ) -> Result<Step, ModalError> {
        let (token, mut abandoned) = self.begin_attempt(wallet.clone(), connector.clone(), role, on_error).await;
        let uri = match connector.as_pairing() {
            Some(pairing) => pairing.pairing_uri(None).await,
            None => Err(ConnectorError::Backend(format!("{} cannot pair", connector.id()))),
        };
        let uri = match uri {
            Ok(uri) => uri,
            Err(error) => {
                let reason = abandoned.borrow().clone();
                return self.finish(token, Err(error), reason).await;
            }
        };

        let current = {
            let mut state = self.inner.lock();
            let current = state.attempt.as_ref().is_some_and(|attempt| attempt.token == token);
            if current {
                self.inner.set_screen(
                    &mut state,
                    Screen::Scan {
                        wallet: wallet.clone(),
                        uri,
                    },
                );
            }
            current
        };
        if !current {
            let reason = abandoned.borrow().clone();
            return self.finish(token, Err(ConnectorError::Cancelled), reason).await;
        }

        let result = self
            .await_connect(token, &wallet, connector, ConnectParams::default(), &mut abandoned, false)
            .await;
        let reason = abandoned.borrow().clone();
        self.finish(token, result, reason).await
    }

    /// Waits for the wallet. The connecting screen appears only once the
    /// grace window has passed.
    async fn await_connect(
        &self,
        token: u64,
        wallet: &WalletId,
        connector: Arc<dyn Connector>,
        params: ConnectParams,
        abandoned: &mut watch::Receiver<Option<SelectOutcome>>,
        show_connecting: bool,
    ) -> Result<Address, ConnectorError> {
        let limit = self.inner.config.connect_timeout;
        let connect = async move {
            match limit {
                Some(limit) => tokio::time::timeout(limit, connector.connect(params))
                    .await
                    .unwrap_or(Err(ConnectorError::Timeout)),
                None => connector.connect(params).await,
            }
        };
        tokio::pin!(connect);

        let grace = tokio::time::sleep(self.inner.config.grace_window);
        tokio::pin!(grace);
        let mut waiting_for_grace = show_connecting;

        loop {
            tokio::select! {
                result = &mut connect => return result,
                Ok(_) = abandoned.wait_for(Option::is_some) => return Err(ConnectorError::Cancelled),
                () = &mut grace, if waiting_for_grace => {
                    waiting_for_grace = false;
                    let mut state = self.inner.lock();
                    if state.attempt.as_ref().is_some_and(|attempt| attempt.token == token) {
                        self.inner.set_screen(&mut state, Screen::Connecting { wallet: wallet.clone() });
                    }
                }
            }
        }
    }

    /// Applies the result of attempt `token`, unless the attempt was
    /// abandoned meanwhile.
    async fn finish(
        &self,
        token: u64,
        result: Result<Address, ConnectorError>,
        abandoned: Option<SelectOutcome>,
    ) -> Result<Step, ModalError> {
        let attempt = {
            let mut state = self.inner.lock();
            match state.attempt.take_if(|attempt| attempt.token == token) {
                Some(attempt) => attempt,
                None => {
                    debug!(token, "stale connection result dropped");
                    let fallback = if state.screen == Screen::Closed {
                        SelectOutcome::Cancelled
                    } else {
                        SelectOutcome::Superseded
                    };
                    return Ok(Step::Done(abandoned.unwrap_or(fallback)));
                }
            }
        };

        match result {
            Ok(address) => self.connected(attempt, address).await,
            Err(error) => Ok(Step::Done(self.failed(attempt, error).await)),
        }
    }

    async fn connected(&self, attempt: Attempt, address: Address) -> Result<Step, ModalError> {
        if let Role::Personal { wrapper } = attempt.role.clone() {
            let wrapper_connector = self.inner.registry.connector(&wrapper)?;
            let Some(wrapper_wallet) = wrapper_connector.as_wrapper() else {
                return Err(RegistryError::NotConfigured {
                    wallet: wrapper,
                    reason: "not a wrapper wallet".to_owned(),
                }
                .into());
            };
            let kind = wrapper_wallet.wrapper_kind();

            let shown = {
                let mut state = self.inner.lock();
                let shown = state.screen != Screen::Closed;
                if shown {
                    state.pending_personal = Some((attempt.wallet_id.clone(), attempt.connector.clone()));
                    self.inner.set_screen(
                        &mut state,
                        Screen::WrapperForm {
                            wrapper,
                            personal: attempt.wallet_id.clone(),
                        },
                    );
                }
                shown
            };
            if !shown {
                self.release(&attempt.wallet_id, &attempt.connector).await;
                return Ok(Step::Done(SelectOutcome::Cancelled));
            }
            info!(personal = %attempt.wallet_id, %address, "personal wallet connected");
            return Ok(if kind == WrapperKind::SmartWallet {
                Step::SubmitWrapper
            } else {
                Step::Done(SelectOutcome::AwaitingInput)
            });
        }

        let snapshot = match self
            .inner
            .session
            .activate(attempt.wallet_id.clone(), attempt.connector.clone())
            .await
        {
            Ok(snapshot) => snapshot,
            Err(error) => return Ok(Step::Done(self.failed(attempt, error).await)),
        };

        let mut state = self.inner.lock();
        state.wrapper = None;
        state.pending_personal = None;
        state.last_error = None;
        let _ = self.inner.events.send(ModalEvent::Connected(snapshot.clone()));
        self.inner.set_screen(&mut state, Screen::Closed);
        info!(wallet = %attempt.wallet_id, %address, "wallet connected");
        Ok(Step::Done(SelectOutcome::Connected(snapshot.address)))
    }

    async fn failed(&self, attempt: Attempt, error: ConnectorError) -> SelectOutcome {
        warn!(wallet = %attempt.wallet_id, %error, "connection failed");
        // A timed out wallet may still answer later; a failed wrapper leaves
        // its personal wallet connected.
        if error == ConnectorError::Timeout || matches!(attempt.role, Role::Wrapper) {
            self.release(&attempt.wallet_id, &attempt.connector).await;
        }

        let mut state = self.inner.lock();
        if state.screen == Screen::Closed {
            return SelectOutcome::Cancelled;
        }
        state.last_error = Some(error.clone());
        let _ = self.inner.events.send(ModalEvent::Failed {
            wallet: attempt.wallet_id,
            error: error.clone(),
        });
        self.inner.set_screen(&mut state, attempt.on_error.with_error(&error));
        SelectOutcome::Failed(error)
    }

    async fn drive(&self, step: Step) -> Result<SelectOutcome, ModalError> {
        match step {
            Step::Done(outcome) => Ok(outcome),
            Step::SubmitWrapper => self.submit_wrapper_form(None, None).await,
        }
    }
}
