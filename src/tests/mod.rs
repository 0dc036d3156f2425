// Tests module
// Overlay: end-to-end relay scenarios over in-memory transports
// Persistence: peer store surviving restarts and shutdown
// Local link: the protected TCP connection across shutdown
