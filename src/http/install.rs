//! Node bootstrap script and binary distribution (§6 `node-install/*`).
//! Grounded in `original_source/go-backend/handler/node_install.go`; the
//! script text is reproduced close to verbatim since it is itself the
//! contract the `gost-node` binary's environment variables rely on.

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::http::AppState;

const INSTALL_SCRIPT: &str = r#"#!/bin/bash
set -e

NODE_ID=$1
NODE_SECRET=$2
PANEL_ADDR=$3

if [ -z "$NODE_ID" ] || [ -z "$NODE_SECRET" ] || [ -z "$PANEL_ADDR" ]; then
    echo "Usage: $0 <node_id> <node_secret> <panel_addr>"
    exit 1
fi

ARCH=$(uname -m)
case $ARCH in
    x86_64) ARCH="amd64" ;;
    aarch64) ARCH="arm64" ;;
    armv7l) ARCH="arm" ;;
    *) echo "Unsupported architecture: $ARCH"; exit 1 ;;
esac

echo "Downloading gost-node for $ARCH..."
curl -fsSL "$PANEL_ADDR/node-install/binary/$ARCH" -o /usr/local/bin/gost-node
chmod +x /usr/local/bin/gost-node

WS_ADDR=$(echo "$PANEL_ADDR" | sed 's|^https://|wss://|; s|^http://|ws://|')

cat > /etc/systemd/system/gost-node.service << EOF
[Unit]
Description=GOST Node
After=network.target

[Service]
Type=simple
Environment=NODE_ID=$NODE_ID
Environment=NODE_SECRET=$NODE_SECRET
Environment=WS_ADDR=${WS_ADDR}/system-info
Environment=FLOW_ADDR=$PANEL_ADDR
ExecStart=/usr/local/bin/gost-node
Restart=always
RestartSec=5

[Install]
WantedBy=multi-user.target
EOF

systemctl daemon-reload
systemctl enable gost-node
systemctl restart gost-node

echo "GOST Node installed and started successfully!"
echo "Node ID: $NODE_ID"
"#;

/// `GET /node-install/script` (public): the systemd bootstrap one-liner's
/// payload, parameterised by the node id/secret/panel address the caller
/// passes as positional shell arguments.
pub async fn script() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        INSTALL_SCRIPT,
    )
}

const ALLOWED_ARCHS: &[&str] = &["amd64", "arm64", "arm"];

/// `GET /node-install/binary/{arch}` (public): serves the prebuilt
/// `gost-node` binary for one of the three architectures the install
/// script's `uname -m` mapping produces.
pub async fn binary(State(state): State<AppState>, Path(arch): Path<String>) -> Response {
    if !ALLOWED_ARCHS.contains(&arch.as_str()) {
        return (StatusCode::BAD_REQUEST, "invalid architecture").into_response();
    }

    let path = state.config.node_binary_dir.join(format!("gost-node-{arch}"));
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (header::CONTENT_DISPOSITION, format!("attachment; filename=gost-node-{arch}")),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, format!("Binary not found for architecture: {arch}")).into_response(),
    }
}
