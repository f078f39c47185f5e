// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud-init bootstrap payload.
//!
//! The document installs the admin credential, (re)deploys the admin service
//! and calls the phone-home endpoint once the instance has booted. The
//! endpoint is called twice: from `runcmd` via `signal-ready.sh`, and by
//! cloud-init's `phone_home` module. Repeated calls are ignored. The
//! provider substitutes `{{ v1.instance_id }}` at boot time.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};

const CONTROL_URL_PLACEHOLDER: &str = "@CONTROL_API_URL@";
const ADMIN_KEY_PLACEHOLDER: &str = "@ADMIN_API_KEY@";

const TEMPLATE: &str = r#"## template: jinja
#cloud-config
package_update: true
package_upgrade: false
packages: [chrony]

write_files:
  - path: /usr/local/sbin/deploy-admin-service.sh
    permissions: '0755'
    owner: root:root
    content: |
      #!/usr/bin/env bash
      set -euo pipefail
      DIR="/opt/admin-service"
      if [ -d "$DIR/.git" ]; then
        cd "$DIR"
        git fetch origin master --prune || true
        git reset --hard origin/master || true
      fi
      systemctl daemon-reload
      systemctl restart task-admin-api || systemctl start task-admin-api || true

  - path: /usr/local/sbin/signal-ready.sh
    permissions: '0755'
    owner: root:root
    content: |
      #!/usr/bin/env bash
      set -euo pipefail
      CTRL="@CONTROL_API_URL@"
      IID="{{ v1.instance_id }}"
      HN="$(hostname)"
      BODY="$(printf '{"instance_id":"%s","hostname":"%s"}' "$IID" "$HN")"
      curl -sSf -H 'Content-Type: application/json' -X POST "$CTRL/provisioning/phone-home/$IID/done" -d "$BODY" || true

  - path: /etc/task-provisioning.env
    permissions: '0640'
    owner: root:root
    content: |
      ADMIN_API_KEY=@ADMIN_API_KEY@
      CONTROL_API_URL=@CONTROL_API_URL@

runcmd:
  - [ systemctl, restart, chrony ]
  - [ bash, -lc, "/usr/local/sbin/deploy-admin-service.sh" ]
  - [ bash, -lc, "/usr/local/sbin/signal-ready.sh || true" ]

phone_home:
  url: "@CONTROL_API_URL@/provisioning/phone-home/{{ v1.instance_id }}/done"
  post: [instance_id, hostname]
  tries: 5
  timeout: 10
"#;

/// Rendered bootstrap document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPayload {
    /// Plain cloud-init document.
    pub cloud_init: String,
    /// Base64 of `cloud_init`, as sent in the create request.
    pub user_data: String,
    /// Lowercase hex SHA-1 of `cloud_init`.
    pub hash: String,
}

/// Render the bootstrap payload for a new instance.
pub fn build_bootstrap(admin_api_key: &str, control_api_url: &str) -> BootstrapPayload {
    let control_api_url = control_api_url.trim_end_matches('/');
    let cloud_init = TEMPLATE
        .replace(CONTROL_URL_PLACEHOLDER, control_api_url)
        .replace(ADMIN_KEY_PLACEHOLDER, admin_api_key);

    let user_data = STANDARD.encode(cloud_init.as_bytes());
    let hash = Sha1::digest(cloud_init.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();

    BootstrapPayload {
        cloud_init,
        user_data,
        hash,
    }
}
