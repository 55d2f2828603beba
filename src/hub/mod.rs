//file: modline/src/hub/mod.rs

//! Bus de diffusion temps réel des événements de modération vers les
//! abonnés WebSocket.

/// Bus de diffusion des événements de modération vers les abonnés WebSocket (C10)
pub mod session;
