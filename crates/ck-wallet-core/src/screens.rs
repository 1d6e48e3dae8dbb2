//! Render-ready description of each modal screen.
//!
//! Views are recomputed from the current [`Screen`] on every render and never
//! touch connection state. User input comes back as a [`ScreenAction`] passed
//! to [`ConnectModal::dispatch`](crate::ConnectModal::dispatch).

use alloy_primitives::Address;
use ck_api_types::{ChainId, WalletId, WalletMeta};
use ck_connectors::WrapperKind;

use crate::{Screen, WalletKind, WalletRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenAction {
    SelectWallet(WalletId),
    Back,
    Close,
    /// Show where to get a wallet that is not installed.
    GetStarted(WalletId),
    OpenUrl(String),
    SubmitWrapperForm {
        safe_address: Option<Address>,
        chain_id: Option<ChainId>,
    },
    SubmitLocal {
        password: Option<String>,
    },
    SubmitEmail {
        email: String,
    },
    SubmitOtp {
        otp: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    SelectWallet,
    Back,
    Close,
    GetStarted,
    OpenUrl,
    SubmitWrapperForm,
    SubmitLocal,
    SubmitEmail,
    SubmitOtp,
}

impl ScreenAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::SelectWallet(_) => ActionKind::SelectWallet,
            Self::Back => ActionKind::Back,
            Self::Close => ActionKind::Close,
            Self::GetStarted(_) => ActionKind::GetStarted,
            Self::OpenUrl(_) => ActionKind::OpenUrl,
            Self::SubmitWrapperForm { .. } => ActionKind::SubmitWrapperForm,
            Self::SubmitLocal { .. } => ActionKind::SubmitLocal,
            Self::SubmitEmail { .. } => ActionKind::SubmitEmail,
            Self::SubmitOtp { .. } => ActionKind::SubmitOtp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletItem {
    pub id: WalletId,
    pub name: String,
    pub icon_url: String,
    pub installed: bool,
    pub selectable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadLink {
    pub label: &'static str,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Email,
    Password,
    Otp,
    Address,
    Chain(Vec<ChainId>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub name: &'static str,
    pub label: String,
    pub kind: FieldKind,
    pub required: bool,
}

impl FormField {
    fn new(name: &'static str, label: impl Into<String>, kind: FieldKind, required: bool) -> Self {
        Self {
            name,
            label: label.into(),
            kind,
            required,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScreenView {
    pub title: String,
    pub subtitle: Option<String>,
    pub wallets: Vec<WalletItem>,
    pub qr_uri: Option<String>,
    pub download_links: Vec<DownloadLink>,
    pub fields: Vec<FormField>,
    pub error: Option<String>,
    pub spinner: bool,
    pub actions: Vec<ActionKind>,
}

impl ScreenView {
    pub fn allows(&self, action: &ScreenAction) -> bool {
        self.actions.contains(&action.kind())
    }
}

const DISMISS: [ActionKind; 2] = [ActionKind::Back, ActionKind::Close];

fn with_dismiss(mut actions: Vec<ActionKind>) -> Vec<ActionKind> {
    actions.extend(DISMISS);
    actions
}

fn wallet_name(registry: &WalletRegistry, wallet: &WalletId) -> String {
    registry
        .descriptor(wallet)
        .map(|descriptor| descriptor.meta.name.clone())
        .unwrap_or_else(|_| wallet.to_string())
}

fn wrapper_label(registry: &WalletRegistry, wrapper: &WalletId) -> &'static str {
    match registry.descriptor(wrapper).map(|descriptor| descriptor.kind) {
        Ok(WalletKind::Wrapper(kind)) => kind.label(),
        _ => "Smart account",
    }
}

fn wallet_items(registry: &WalletRegistry, personal_only: bool) -> Vec<WalletItem> {
    registry
        .wallet_infos(personal_only)
        .into_iter()
        .map(|info| WalletItem {
            id: info.id,
            name: info.meta.name,
            icon_url: info.meta.icon_url,
            installed: info.installed,
            selectable: info.selectable,
        })
        .collect()
}

fn download_links(meta: &WalletMeta) -> Vec<DownloadLink> {
    let Some(urls) = &meta.urls else {
        return Vec::new();
    };
    [
        ("Chrome extension", &urls.chrome),
        ("iOS app", &urls.ios),
        ("Android app", &urls.android),
        ("Website", &urls.homepage),
    ]
    .into_iter()
    .filter_map(|(label, url)| url.clone().map(|url| DownloadLink { label, url }))
    .collect()
}

/// View model for `screen`.
pub fn render(screen: &Screen, registry: &WalletRegistry) -> ScreenView {
    match screen {
        Screen::Closed => ScreenView::default(),
        Screen::WalletList => ScreenView {
            title: "Connect a wallet".to_owned(),
            wallets: wallet_items(registry, false),
            actions: vec![ActionKind::SelectWallet, ActionKind::Close],
            ..ScreenView::default()
        },
        Screen::GetStarted { wallet } => {
            let name = wallet_name(registry, wallet);
            let links = registry
                .descriptor(wallet)
                .map(|descriptor| download_links(&descriptor.meta))
                .unwrap_or_default();
            ScreenView {
                subtitle: Some(format!("{name} is not installed in this browser")),
                title: format!("Get {name}"),
                download_links: links,
                actions: with_dismiss(vec![ActionKind::OpenUrl]),
                ..ScreenView::default()
            }
        }
        Screen::Scan { wallet, uri } => {
            let name = wallet_name(registry, wallet);
            let mut actions = Vec::new();
            let has_downloads = registry
                .descriptor(wallet)
                .is_ok_and(|descriptor| !download_links(&descriptor.meta).is_empty());
            if has_downloads {
                actions.push(ActionKind::GetStarted);
            }
            ScreenView {
                title: format!("Scan with {name}"),
                subtitle: Some("Scan this code with your phone to connect".to_owned()),
                qr_uri: Some(uri.clone()),
                actions: with_dismiss(actions),
                ..ScreenView::default()
            }
        }
        Screen::Connecting { wallet } => ScreenView {
            title: "Requesting connection".to_owned(),
            subtitle: Some(format!("Open {} to continue", wallet_name(registry, wallet))),
            spinner: true,
            actions: DISMISS.to_vec(),
            ..ScreenView::default()
        },
        Screen::SelectPersonalWallet { wrapper } => ScreenView {
            title: "Select your personal wallet".to_owned(),
            subtitle: Some(format!(
                "{} accounts are controlled by a personal wallet",
                wrapper_label(registry, wrapper)
            )),
            wallets: wallet_items(registry, true),
            actions: with_dismiss(vec![ActionKind::SelectWallet]),
            ..ScreenView::default()
        },
        Screen::WrapperForm { wrapper, personal } => {
            let label = wrapper_label(registry, wrapper);
            let subtitle = Some(format!("Controlled by {}", wallet_name(registry, personal)));
            match registry.descriptor(wrapper).map(|descriptor| descriptor.kind) {
                Ok(WalletKind::Wrapper(WrapperKind::SmartWallet)) => ScreenView {
                    title: format!("Setting up {label}"),
                    subtitle,
                    spinner: true,
                    actions: DISMISS.to_vec(),
                    ..ScreenView::default()
                },
                _ => ScreenView {
                    title: format!("Connect to {label}"),
                    subtitle,
                    fields: vec![
                        FormField::new("safe_address", "Safe address", FieldKind::Address, true),
                        FormField::new(
                            "chain_id",
                            "Network",
                            FieldKind::Chain(registry.options().safe.supported_chains.clone()),
                            false,
                        ),
                    ],
                    actions: with_dismiss(vec![ActionKind::SubmitWrapperForm]),
                    ..ScreenView::default()
                },
            }
        }
        Screen::LocalWallet { has_saved, error, .. } => ScreenView {
            title: "Guest wallet".to_owned(),
            subtitle: Some(if *has_saved {
                "Unlock your saved guest wallet".to_owned()
            } else {
                "Leave the password empty for a wallet that lasts this session only".to_owned()
            }),
            fields: vec![FormField::new("password", "Password", FieldKind::Password, *has_saved)],
            error: error.clone(),
            actions: with_dismiss(vec![ActionKind::SubmitLocal]),
            ..ScreenView::default()
        },
        Screen::EmbeddedEmail { error, .. } => ScreenView {
            title: "Sign in with email".to_owned(),
            fields: vec![FormField::new("email", "Email address", FieldKind::Email, true)],
            error: error.clone(),
            actions: with_dismiss(vec![ActionKind::SubmitEmail]),
            ..ScreenView::default()
        },
        Screen::EmbeddedOtp { email, error, .. } => ScreenView {
            title: "Enter confirmation code".to_owned(),
            subtitle: Some(format!("We sent a code to {email}")),
            fields: vec![FormField::new("otp", "Code", FieldKind::Otp, true)],
            error: error.clone(),
            actions: with_dismiss(vec![ActionKind::SubmitOtp]),
            ..ScreenView::default()
        },
    }
}
